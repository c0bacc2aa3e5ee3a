//! HTTP transfers that generate load for the throughput engine.
//!
//! Downloads stream `GET /download?size=N` and count every chunk as it
//! arrives. Uploads `POST` a zero-filled body to `/upload`; their progress is
//! counted by the server and reported over the stats channel instead.

use crate::ookla::requests::user_agent;
use crate::ookla::server::MeasurementServer;
use bytes::Bytes;
use log::trace;
use reqwest::header::{HeaderValue, CACHE_CONTROL, USER_AGENT};
use reqwest::Client;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Bytes accumulated since the engine last sampled.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Read and reset the accumulator.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct TransferError(Box<dyn Error + Send + Sync>);

impl TransferError {
    pub fn new(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer failed: {}", self.0)
    }
}

impl Error for TransferError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.0.as_ref())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(error: reqwest::Error) -> Self {
        Self::new(error)
    }
}

/// One load-generating connection to a measurement server.
pub trait TransferTransport: Send + Sync + 'static {
    /// Fetch `size` bytes from `server`, adding each chunk to `counter` as it
    /// arrives.
    fn download(
        &self,
        server: &MeasurementServer,
        size: u64,
        guid: &str,
        counter: &ByteCounter,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Send `size` bytes to `server`.
    fn upload(
        &self,
        server: &MeasurementServer,
        size: u64,
        guid: &str,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Transfers over HTTPS with reqwest.
#[derive(Debug)]
pub struct HttpTransfer {
    client: Client,
    payload: Mutex<Bytes>,
}

impl HttpTransfer {
    pub fn new(client: Client) -> Self {
        Self { client, payload: Mutex::new(Bytes::new()) }
    }

    /// A zero-filled body of `size` bytes, shared by concurrent uploads.
    fn payload(&self, size: u64) -> Bytes {
        let mut payload = match self.payload.lock() {
            Ok(payload) => payload,
            Err(poisoned) => poisoned.into_inner(),
        };

        if payload.len() as u64 != size {
            *payload = Bytes::from(vec![0u8; size as usize]);
        }
        payload.clone()
    }
}

fn transfer_url(server: &MeasurementServer, path: &str) -> String {
    format!("https://{}/{}?nocache={}", server.host, path, Uuid::new_v4())
}

impl TransferTransport for HttpTransfer {
    fn download(
        &self,
        server: &MeasurementServer,
        size: u64,
        guid: &str,
        counter: &ByteCounter,
    ) -> impl Future<Output = Result<(), TransferError>> + Send {
        let url = format!(
            "{}&size={}&guid={}",
            transfer_url(server, "download"),
            size,
            guid
        );

        async move {
            trace!("GET {}", url);

            let mut response = self
                .client
                .get(&url)
                .header(USER_AGENT, user_agent())
                .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
                .send()
                .await?
                .error_for_status()?;

            while let Some(chunk) = response.chunk().await? {
                counter.add(chunk.len() as u64);
            }

            Ok(())
        }
    }

    fn upload(
        &self,
        server: &MeasurementServer,
        size: u64,
        guid: &str,
    ) -> impl Future<Output = Result<(), TransferError>> + Send {
        let url = format!("{}&guid={}", transfer_url(server, "upload"), guid);
        let body = self.payload(size);

        async move {
            trace!("POST {} ({} bytes)", url, body.len());

            self.client
                .post(&url)
                .header(USER_AGENT, user_agent())
                .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
                .body(body)
                .send()
                .await?
                .error_for_status()?;

            Ok(())
        }
    }
}
