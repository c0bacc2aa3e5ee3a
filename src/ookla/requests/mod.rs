pub mod config;
pub mod servers;

use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, USER_AGENT};
use reqwest::Method;
use serde::Deserialize;
use std::borrow::Cow;

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");
const REPO: &str = env!("CARGO_PKG_REPOSITORY");

/// Base URL of the speedtest.net directory and config API.
pub(crate) static BASE_URL: &str = "https://www.speedtest.net";

/// How a response body is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Xml,
}

/// User agent sent with every request, including transfers and probes.
pub fn user_agent() -> String {
    format!(
        "Mozilla/5.0 ({}; U; {}; en-us) {}/{} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH,
        NAME,
        VERSION,
        REPO
    )
}

pub trait Request {
    type Response: for<'de> Deserialize<'de>;

    const METHOD: Method = Method::GET;

    const FORMAT: ResponseFormat = ResponseFormat::Json;

    fn url(&self) -> Cow<'_, str>;

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(agent) = HeaderValue::from_str(&user_agent()) {
            headers.insert(USER_AGENT, agent);
        }

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        headers
    }
}

impl<R: Request> Request for &R {
    type Response = R::Response;

    const METHOD: Method = R::METHOD;

    const FORMAT: ResponseFormat = R::FORMAT;

    fn url(&self) -> Cow<'_, str> {
        (**self).url()
    }

    fn headers(&self) -> HeaderMap {
        (**self).headers()
    }
}
