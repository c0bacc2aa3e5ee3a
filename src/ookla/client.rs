use crate::ookla::requests::{Request, ResponseFormat};
use log::debug;
use reqwest::Client as ReqwestClient;
use std::error::Error;
use std::time::Duration;

/// Timeout applied to directory and config requests. Transfers are bounded
/// by the engine instead.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Client {
    client: ReqwestClient,
}

impl Client {
    pub fn new() -> Self {
        Client { client: ReqwestClient::new() }
    }

    /// The underlying HTTP client, shared with the transfer transport.
    pub fn http(&self) -> &ReqwestClient {
        &self.client
    }

    pub async fn send<R: Request>(
        &self,
        request: R,
    ) -> Result<R::Response, Box<dyn Error + Send + Sync>> {
        let url = request.url();
        debug!("{} {}", R::METHOD, url);

        let response = self
            .client
            .request(R::METHOD, url.as_ref())
            .headers(request.headers())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let text = response.text().await?;

        decode::<R::Response>(R::FORMAT, &text)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn decode<T: for<'de> serde::Deserialize<'de>>(
    format: ResponseFormat,
    text: &str,
) -> Result<T, Box<dyn Error + Send + Sync>> {
    Ok(match format {
        ResponseFormat::Json => serde_json::from_str(text)?,
        ResponseFormat::Xml => quick_xml::de::from_str(text)?,
    })
}
