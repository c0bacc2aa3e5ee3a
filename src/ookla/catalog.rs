//! Server discovery and latency ranking.
//!
//! Candidates come from the speedtest.net directory; ranking probes every
//! candidate concurrently and keeps the fastest few.

use crate::config::ProbeConfig;
use crate::errors::BoxError;
use crate::ookla::client::Client;
use crate::ookla::probe::probe_server;
use crate::ookla::probe::transport::ProbeConnector;
use crate::ookla::requests::config::{ClientInfo, ConfigRequest};
use crate::ookla::requests::servers::ServerList;
use crate::ookla::server::{MeasurementServer, RankedServerSet};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::retry::{retry_async, RetryConfig};
use crate::units::DistanceUnit;
use futures::future::join_all;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Slack on top of the probe deadline before a ranking probe is abandoned.
const RANKING_GRACE: Duration = Duration::from_secs(1);

/// Source of client config and candidate servers.
pub trait Directory: Send + Sync + 'static {
    fn fetch_config(&self) -> impl Future<Output = Result<ClientInfo, BoxError>> + Send;

    fn fetch_servers(
        &self,
        query: &ServerList,
    ) -> impl Future<Output = Result<Vec<MeasurementServer>, BoxError>> + Send;
}

impl Directory for Client {
    fn fetch_config(&self) -> impl Future<Output = Result<ClientInfo, BoxError>> + Send {
        async move { Ok(self.send(ConfigRequest).await?.client) }
    }

    fn fetch_servers(
        &self,
        query: &ServerList,
    ) -> impl Future<Output = Result<Vec<MeasurementServer>, BoxError>> + Send {
        self.send(query)
    }
}

pub struct ServerCatalog<D, P> {
    directory: Arc<D>,
    connector: Arc<P>,
    retry: RetryConfig,
    distance_unit: DistanceUnit,
    probe: ProbeConfig,
    precision: u32,
}

impl<D: Directory, P: ProbeConnector> ServerCatalog<D, P> {
    pub fn new(directory: Arc<D>, connector: Arc<P>) -> Self {
        Self {
            directory,
            connector,
            retry: RetryConfig::default(),
            distance_unit: DistanceUnit::default(),
            probe: ProbeConfig::ranking(),
            precision: 2,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_distance_unit(mut self, unit: DistanceUnit) -> Self {
        self.distance_unit = unit;
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    /// Client identity from the config endpoint.
    pub async fn client_info(&self) -> Result<ClientInfo, BoxError> {
        let info = retry_async(&self.retry, "Fetch client config", || {
            self.directory.fetch_config()
        })
        .await?;

        debug!("Client {} ({}, {})", info.ip, info.isp, info.country);
        Ok(info)
    }

    /// The `limit` servers nearest to the client.
    pub async fn list_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<MeasurementServer>, BoxError> {
        self.fetch(ServerList::nearest(limit)).await
    }

    /// Servers whose name, sponsor or location matches `term`.
    pub async fn search(
        &self,
        term: &str,
        limit: usize,
    ) -> Result<Vec<MeasurementServer>, BoxError> {
        self.fetch(ServerList::search(term, limit)).await
    }

    async fn fetch(&self, query: ServerList) -> Result<Vec<MeasurementServer>, BoxError> {
        let servers = retry_async(&self.retry, "Fetch server list", || {
            self.directory.fetch_servers(&query)
        })
        .await?;

        debug!("Directory returned {} server(s)", servers.len());

        Ok(servers
            .into_iter()
            .map(|server| server.with_distance_unit(self.distance_unit))
            .collect())
    }

    /// Probe all `candidates` concurrently and keep the `shortlist_size`
    /// fastest, ascending by latency.
    ///
    /// Unreachable candidates are dropped; it is an error only if none
    /// answer.
    pub async fn rank(
        &self,
        candidates: Vec<MeasurementServer>,
        shortlist_size: usize,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<RankedServerSet, BoxError> {
        let total = candidates.len();
        info!("Ranking {} candidate server(s)", total);

        let never = CancellationToken::new();
        let deadline = self.probe.timeout + RANKING_GRACE;

        let probes = candidates.into_iter().map(|server| {
            let never = &never;
            async move {
                let probe = probe_server(
                    &*self.connector,
                    &server.host,
                    None,
                    &self.probe,
                    self.precision,
                    never,
                    None,
                );
                let result = tokio::time::timeout(deadline, probe).await;
                (server, result)
            }
        });

        let mut reachable = Vec::with_capacity(total);
        for (mut server, result) in join_all(probes).await {
            let latency = match result {
                Ok(Ok(ping)) => Some(ping.latency),
                Ok(Err(e)) => {
                    warn!("Server {} ({}) excluded: {}", server.id, server.host, e);
                    None
                }
                Err(_) => {
                    warn!("Server {} ({}) excluded: no answer within {:?}", server.id, server.host, deadline);
                    None
                }
            };

            if let Some(progress) = progress {
                progress.on_progress(ProgressEvent::ServerRanked {
                    server_id: server.id,
                    latency_ms: latency,
                });
            }

            if let Some(latency) = latency {
                debug!("Server {} answered in {} ms", server.id, latency);
                server.latency = Some(latency);
                reachable.push(server);
            }
        }

        if reachable.is_empty() {
            return Err(format!("no reachable servers among {} candidate(s)", total).into());
        }

        let ranked = RankedServerSet::rank(reachable, shortlist_size);
        if let Some(best) = ranked.best() {
            info!(
                "Best server: {} ({}, {}) at {} ms",
                best.sponsor,
                best.name,
                best.host,
                best.latency.unwrap_or_default()
            );
        }

        Ok(ranked)
    }
}
