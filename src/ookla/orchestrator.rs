//! Staged speed test runs.
//!
//! A full run walks [`Stage`] in order: fetch the client config, list
//! candidate servers, rank them, take an idle latency baseline against the
//! best one, then measure download and upload. Every failure is reported
//! through [`SpeedTestError::at_stage`] so the caller learns which stage gave
//! up.

use crate::config::TestOptions;
use crate::errors::{BoxError, SpeedTestError, Stage};
use crate::ookla::catalog::{Directory, ServerCatalog};
use crate::ookla::client::Client;
use crate::ookla::engine::ThroughputEngine;
use crate::ookla::probe::probe_server;
use crate::ookla::probe::transport::{ProbeConnector, WebSocketConnector};
use crate::ookla::server::{MeasurementServer, RankedServerSet};
use crate::ookla::transfer::{HttpTransfer, TransferTransport};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::results::{PingResult, TestResult, ThroughputResult};
use crate::stats::round_to;
use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct SpeedTest<D, T, P> {
    directory: Arc<D>,
    transport: Arc<T>,
    connector: Arc<P>,
    options: TestOptions,
    progress: Option<Arc<dyn ProgressCallback>>,
}

impl SpeedTest<Client, HttpTransfer, WebSocketConnector> {
    /// A test against speedtest.net over HTTPS and WebSockets.
    pub fn new(options: TestOptions) -> Self {
        let client = Client::new();
        let transport = HttpTransfer::new(client.http().clone());
        Self::with_components(client, transport, WebSocketConnector, options)
    }
}

impl<D: Directory, T: TransferTransport, P: ProbeConnector> SpeedTest<D, T, P> {
    pub fn with_components(
        directory: D,
        transport: T,
        connector: P,
        options: TestOptions,
    ) -> Self {
        Self {
            directory: Arc::new(directory),
            transport: Arc::new(transport),
            connector: Arc::new(connector),
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn options(&self) -> &TestOptions {
        &self.options
    }

    fn catalog(&self) -> ServerCatalog<D, P> {
        ServerCatalog::new(Arc::clone(&self.directory), Arc::clone(&self.connector))
            .with_retry(self.options.retry.clone())
            .with_distance_unit(self.options.units.distance)
            .with_probe(self.options.ranking_probe.clone())
            .with_precision(self.options.precision)
    }

    fn progress(&self) -> Option<&dyn ProgressCallback> {
        self.progress.as_deref()
    }

    fn enter(&self, stage: Stage) {
        debug!("Stage: {}", stage);
        if let Some(progress) = self.progress() {
            progress.on_progress(ProgressEvent::StageChange(stage));
        }
    }

    /// The servers nearest to the client, `count` of them or the directory
    /// default.
    pub async fn list_servers(
        &self,
        count: Option<usize>,
    ) -> Result<Vec<MeasurementServer>, SpeedTestError> {
        let count = count.unwrap_or(crate::config::DEFAULT_SERVER_LIST_SIZE);
        self.catalog()
            .list_candidates(count)
            .await
            .map_err(|e| SpeedTestError::at_stage(Stage::ListingServers, e))
    }

    /// Servers matching `term`.
    pub async fn search_servers(
        &self,
        term: &str,
        count: Option<usize>,
    ) -> Result<Vec<MeasurementServer>, SpeedTestError> {
        let count = count.unwrap_or(crate::config::DEFAULT_SERVER_LIST_SIZE);
        self.catalog()
            .search(term, count)
            .await
            .map_err(|e| SpeedTestError::at_stage(Stage::ListingServers, e))
    }

    /// Rank `candidates` by latency into the configured shortlist.
    pub async fn rank_best_servers(
        &self,
        candidates: Vec<MeasurementServer>,
    ) -> Result<RankedServerSet, SpeedTestError> {
        self.catalog()
            .rank(candidates, self.options.shortlist_size, self.progress())
            .await
            .map_err(|e| SpeedTestError::at_stage(Stage::RankingServers, e))
    }

    /// Idle latency and jitter against `server`.
    pub async fn measure_latency(
        &self,
        server: &MeasurementServer,
        session_id: &str,
    ) -> Result<PingResult, SpeedTestError> {
        probe_server(
            &*self.connector,
            &server.host,
            Some(session_id),
            &self.options.baseline_probe,
            self.options.precision,
            &CancellationToken::new(),
            self.progress(),
        )
        .await
        .map_err(|e| SpeedTestError::at_stage(Stage::ProbingBaseline, e))
    }

    pub async fn measure_download(
        &self,
        servers: &[MeasurementServer],
        primary: &MeasurementServer,
        session_id: &str,
    ) -> Result<ThroughputResult, SpeedTestError> {
        let mut engine = ThroughputEngine::new(
            self.options.download.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.connector),
        )
        .with_unit(self.options.units.download)
        .with_precision(self.options.precision)
        .with_loaded_latency(self.options.loaded_latency);
        if let Some(progress) = &self.progress {
            engine = engine.with_progress(Arc::clone(progress));
        }

        engine
            .measure_download(servers, primary, session_id)
            .await
            .map_err(|e| SpeedTestError::at_stage(Stage::MeasuringDownload, e))
    }

    pub async fn measure_upload(
        &self,
        primary: &MeasurementServer,
        session_id: &str,
    ) -> Result<ThroughputResult, SpeedTestError> {
        let mut engine = ThroughputEngine::new(
            self.options.upload.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.connector),
        )
        .with_unit(self.options.units.upload)
        .with_precision(self.options.precision)
        .with_loaded_latency(self.options.loaded_latency)
        .with_stats_timeout(self.options.stats_listener_timeout);
        if let Some(progress) = &self.progress {
            engine = engine.with_progress(Arc::clone(progress));
        }

        engine
            .measure_upload(primary, session_id)
            .await
            .map_err(|e| SpeedTestError::at_stage(Stage::MeasuringUpload, e))
    }

    /// Candidates for ranking: the pinned server alone, or the nearest few.
    async fn candidates(&self) -> Result<Vec<MeasurementServer>, SpeedTestError> {
        let Some(id) = self.options.server_id else {
            return self.list_servers(Some(self.options.servers_to_fetch)).await;
        };

        let servers = self.list_servers(None).await?;
        match servers.into_iter().find(|server| server.id == id) {
            Some(server) => Ok(vec![server]),
            None => {
                let reason: BoxError =
                    format!("server {} is not in the directory's list", id).into();
                Err(SpeedTestError::at_stage(Stage::ListingServers, reason)
                    .with_suggestion("Use --list to see the available server ids."))
            }
        }
    }

    /// Run every stage and assemble the result.
    pub async fn run_full_test(&self) -> Result<TestResult, SpeedTestError> {
        let started = Instant::now();
        let session_id = Uuid::new_v4().to_string();
        info!("Starting speed test, session {}", session_id);

        self.enter(Stage::FetchingConfig);
        let client = self
            .catalog()
            .client_info()
            .await
            .map_err(|e| SpeedTestError::at_stage(Stage::FetchingConfig, e))?;

        self.enter(Stage::ListingServers);
        let candidates = self.candidates().await?;

        self.enter(Stage::RankingServers);
        let ranked = self.rank_best_servers(candidates).await?;
        let best = ranked.best().cloned().ok_or_else(|| {
            let reason: BoxError = "the ranked shortlist is empty".into();
            SpeedTestError::at_stage(Stage::RankingServers, reason)
        })?;

        self.enter(Stage::ProbingBaseline);
        let ping = self.measure_latency(&best, &session_id).await?;
        info!("Idle latency {} ms against {}", ping.latency, best.host);

        let download = if self.options.measure_download {
            self.enter(Stage::MeasuringDownload);
            let pool = if self.options.is_multi_server() {
                ranked.as_slice()
            } else {
                std::slice::from_ref(&best)
            };
            Some(self.measure_download(pool, &best, &session_id).await?)
        } else {
            None
        };

        let upload = if self.options.measure_upload {
            self.enter(Stage::MeasuringUpload);
            Some(self.measure_upload(&best, &session_id).await?)
        } else {
            None
        };

        self.enter(Stage::Done);

        Ok(TestResult {
            timestamp: Utc::now(),
            client,
            server: best,
            servers: ranked,
            ping,
            download,
            upload,
            total_time_secs: round_to(started.elapsed().as_secs_f64(), 1),
        })
    }
}
