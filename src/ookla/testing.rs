//! In-memory directory, probe channel and transfers, driven by tokio's
//! paused clock.

use crate::errors::BoxError;
use crate::ookla::catalog::Directory;
use crate::ookla::probe::transport::{ProbeConnector, ProbeSocket};
use crate::ookla::probe::ProbeError;
use crate::ookla::requests::config::ClientInfo;
use crate::ookla::requests::servers::ServerList;
use crate::ookla::server::tests::server;
use crate::ookla::server::MeasurementServer;
use crate::ookla::transfer::{ByteCounter, TransferError, TransferTransport};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::{ready, Future};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

const STATS_INTERVAL: Duration = Duration::from_millis(50);
const TRANSFER_STEP: Duration = Duration::from_millis(10);

/// Answers each line after a fixed latency.
pub struct MockSocket {
    latency: Duration,
    pending: VecDeque<(Instant, String)>,
    upload_stats: Option<Arc<AtomicU64>>,
    next_report: Option<Instant>,
}

impl MockSocket {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            pending: VecDeque::new(),
            upload_stats: None,
            next_report: None,
        }
    }

    /// Answer `UPLOAD_STATS` with the running total of `delivered`.
    pub fn with_upload_stats(mut self, delivered: Arc<AtomicU64>) -> Self {
        self.upload_stats = Some(delivered);
        self
    }

    fn reply(&mut self, message: impl Into<String>) {
        let due = Instant::now() + self.latency;
        self.pending.push_back((due, message.into()));
    }
}

impl ProbeSocket for MockSocket {
    fn send(
        &mut self,
        line: String,
    ) -> impl Future<Output = Result<(), ProbeError>> + Send {
        if let Some(stamp) = line.strip_prefix("PING ") {
            self.reply(format!("PONG {}", stamp));
        } else if line.starts_with("HI") {
            self.reply("HELLO 2.11 (2.11.0) 2023-01-01.0000.mock");
        } else if line == "GETIP" {
            self.reply("YOURIP 203.0.113.7");
        } else if line.starts_with("UPLOAD_STATS") && self.upload_stats.is_some() {
            self.reply(r#"{"b":0}"#);
            self.next_report = Some(Instant::now() + self.latency + STATS_INTERVAL);
        }

        ready(Ok::<(), ProbeError>(()))
    }

    fn recv(
        &mut self,
    ) -> impl Future<Output = Option<Result<String, ProbeError>>> + Send {
        async move {
            if let Some(&(due, _)) = self.pending.front() {
                sleep_until(due).await;
                return self.pending.pop_front().map(|(_, message)| Ok(message));
            }

            if let (Some(report), Some(delivered)) =
                (self.next_report, self.upload_stats.as_ref())
            {
                sleep_until(report).await;
                self.next_report = Some(report + STATS_INTERVAL);
                let total = delivered.load(Ordering::SeqCst);
                return Some(Ok(format!(r#"{{"b":{}}}"#, total)));
            }

            std::future::pending().await
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        self.pending.clear();
        self.next_report = None;
        ready(())
    }
}

#[derive(Clone)]
pub struct MockConnector {
    default_latency: Duration,
    latencies: HashMap<String, Duration>,
    refused: HashSet<String>,
    upload_stats: Option<Arc<AtomicU64>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            default_latency: Duration::from_millis(5),
            latencies: HashMap::new(),
            refused: HashSet::new(),
            upload_stats: None,
        }
    }
}

impl MockConnector {
    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn with_latency(mut self, host: &str, latency: Duration) -> Self {
        self.latencies.insert(host.to_string(), latency);
        self
    }

    pub fn refusing(mut self, host: &str) -> Self {
        self.refused.insert(host.to_string());
        self
    }

    pub fn with_upload_stats(mut self, delivered: Arc<AtomicU64>) -> Self {
        self.upload_stats = Some(delivered);
        self
    }
}

impl ProbeConnector for MockConnector {
    type Socket = MockSocket;

    fn connect(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Self::Socket, ProbeError>> + Send {
        let result: Result<MockSocket, ProbeError> = if self.refused.contains(host) {
            Err(ProbeError::Connect(format!("connection refused by {}", host)))
        } else {
            let latency =
                self.latencies.get(host).copied().unwrap_or(self.default_latency);
            let socket = MockSocket::new(latency);
            Ok(match &self.upload_stats {
                Some(delivered) => socket.with_upload_stats(Arc::clone(delivered)),
                None => socket,
            })
        };

        ready(result)
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A link of fixed aggregate rate shared by every open transfer.
pub struct MockTransfer {
    rate: u64,
    failing: bool,
    active: Arc<AtomicUsize>,
    peak: AtomicUsize,
    opened: AtomicUsize,
    emitted: AtomicU64,
    delivered: Arc<AtomicU64>,
    per_host: Mutex<HashMap<String, usize>>,
}

impl MockTransfer {
    /// `rate` is in bytes per second across all connections.
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            failing: false,
            active: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            emitted: AtomicU64::new(0),
            delivered: Arc::new(AtomicU64::new(0)),
            per_host: Mutex::new(HashMap::new()),
        }
    }

    /// Every transfer errors out after one step.
    pub fn failing() -> Self {
        Self { failing: true, ..Self::new(0) }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::SeqCst)
    }

    /// Bytes the server side has received from uploads.
    pub fn delivered(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.delivered)
    }

    pub fn opened_per_host(&self) -> HashMap<String, usize> {
        self.per_host.lock().unwrap().clone()
    }

    fn start(&self, host: &str) -> ActiveGuard {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.per_host.lock().unwrap().entry(host.to_string()).or_default() += 1;

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        ActiveGuard(Arc::clone(&self.active))
    }

    async fn stream(&self, size: u64, mut sink: impl FnMut(u64) + Send) -> Result<(), TransferError> {
        let per_step = self.rate * TRANSFER_STEP.as_millis() as u64 / 1000;
        let mut sent = 0;

        while sent < size {
            sleep(TRANSFER_STEP).await;

            if self.failing {
                return Err(TransferError::new("connection reset by peer"));
            }

            let share = per_step / self.active().max(1) as u64;
            let chunk = share.clamp(1, size - sent);
            sent += chunk;
            self.emitted.fetch_add(chunk, Ordering::SeqCst);
            sink(chunk);
        }

        Ok(())
    }
}

impl TransferTransport for MockTransfer {
    fn download(
        &self,
        server: &MeasurementServer,
        size: u64,
        _guid: &str,
        counter: &ByteCounter,
    ) -> impl Future<Output = Result<(), TransferError>> + Send {
        async move {
            let _guard = self.start(&server.host);
            self.stream(size, |bytes| counter.add(bytes)).await
        }
    }

    fn upload(
        &self,
        server: &MeasurementServer,
        size: u64,
        _guid: &str,
    ) -> impl Future<Output = Result<(), TransferError>> + Send {
        async move {
            let _guard = self.start(&server.host);
            let delivered = &self.delivered;
            self.stream(size, |bytes| {
                delivered.fetch_add(bytes, Ordering::SeqCst);
            })
            .await
        }
    }
}

/// A directory of `server1` .. `serverN`.
pub struct MockDirectory {
    servers: Vec<MeasurementServer>,
    client: ClientInfo,
    config_fails: bool,
    server_list_failures: AtomicUsize,
}

impl MockDirectory {
    pub fn with_servers(count: u32) -> Self {
        Self {
            servers: (1..=count).map(|id| server(id, None)).collect(),
            client: ClientInfo {
                ip: "203.0.113.7".to_string(),
                isp: "Example Broadband".to_string(),
                country: "CZ".to_string(),
                ..ClientInfo::default()
            },
            config_fails: false,
            server_list_failures: AtomicUsize::new(0),
        }
    }

    pub fn without_config(mut self) -> Self {
        self.config_fails = true;
        self
    }

    /// Fail the next `times` server list requests with a transient error.
    pub fn failing_server_lists(self, times: usize) -> Self {
        self.server_list_failures.store(times, Ordering::SeqCst);
        self
    }
}

impl Directory for MockDirectory {
    fn fetch_config(&self) -> impl Future<Output = Result<ClientInfo, BoxError>> + Send {
        let result: Result<ClientInfo, BoxError> = if self.config_fails {
            Err("error decoding response body: expected value".into())
        } else {
            Ok(self.client.clone())
        };
        ready(result)
    }

    fn fetch_servers(
        &self,
        query: &ServerList,
    ) -> impl Future<Output = Result<Vec<MeasurementServer>, BoxError>> + Send {
        let failing = self
            .server_list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result: Result<Vec<MeasurementServer>, BoxError> = if failing {
            Err("connection reset by peer".into())
        } else {
            Ok(self
                .servers
                .iter()
                .filter(|s| match &query.search {
                    Some(term) => {
                        s.name.contains(term.as_str())
                            || s.sponsor.contains(term.as_str())
                            || s.id.to_string() == *term
                    }
                    None => true,
                })
                .take(query.limit)
                .cloned()
                .collect())
        };
        ready(result)
    }
}
