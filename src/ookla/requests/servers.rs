use crate::ookla::requests::{Request, BASE_URL};
use crate::ookla::server::MeasurementServer;
use std::borrow::Cow;
use url::form_urlencoded;

/// Directory query: nearest servers, optionally filtered by a search term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerList {
    pub limit: usize,
    pub search: Option<String>,
}

impl ServerList {
    pub fn nearest(limit: usize) -> Self {
        Self { limit, search: None }
    }

    pub fn search(term: impl Into<String>, limit: usize) -> Self {
        Self { limit, search: Some(term.into()) }
    }
}

impl Request for ServerList {
    type Response = Vec<MeasurementServer>;

    fn url(&self) -> Cow<'_, str> {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("engine", "js");
        if let Some(ref term) = self.search {
            query.append_pair("search", term);
        }
        query.append_pair("limit", &self.limit.to_string());
        query.append_pair("https_functional", "true");

        format!("{}/api/js/servers?{}", BASE_URL, query.finish()).into()
    }
}
