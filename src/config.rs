//! Test options and measurement tunables.
//!
//! The defaults are the constants tuned against speedtest.net
//! infrastructure. Other backends will want different connection caps and
//! scaling ratios, so everything here is plain data the caller may override.

use crate::retry::RetryConfig;
use crate::units::{DistanceUnit, SpeedUnit};
use std::time::Duration;

/// Number of servers the directory returns when the caller gives no count.
pub const DEFAULT_SERVER_LIST_SIZE: usize = 100;

/// Whether the download test spreads connections over the shortlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// All connections go to the single best server.
    Single,
    /// Connections are spread over every shortlisted server, least-loaded first.
    #[default]
    Multi,
}

/// How many accepted round trips a probe session collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeLimit {
    /// Close the channel after this many accepted samples.
    Count(usize),
    /// Keep pinging until the caller closes the channel.
    Unbounded,
}

/// Settings for one latency probe session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub limit: ProbeLimit,
    /// Auto-close deadline, independent of the limit.
    pub timeout: Duration,
    /// Whether jitter is computed alongside latency.
    pub track_jitter: bool,
}

impl ProbeConfig {
    pub fn new(limit: ProbeLimit, timeout: Duration, track_jitter: bool) -> Self {
        Self { limit, timeout, track_jitter }
    }

    /// Ranking probe: 5 round trips within 15 seconds, latency only.
    pub fn ranking() -> Self {
        Self::new(ProbeLimit::Count(5), Duration::from_secs(15), false)
    }

    /// Idle baseline probe: 10 round trips within 20 seconds.
    pub fn baseline() -> Self {
        Self::new(ProbeLimit::Count(10), Duration::from_secs(20), true)
    }

    /// Loaded probe that runs for the whole of a throughput test.
    pub fn loaded(timeout: Duration) -> Self {
        Self::new(ProbeLimit::Unbounded, timeout, true)
    }
}

/// What a failed loaded-latency probe does to a throughput result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadedLatencyPolicy {
    /// Keep the throughput figure and report latency/jitter as absent.
    #[default]
    Degrade,
    /// Fail the whole throughput measurement.
    Fail,
}

/// Parameters of one adaptive throughput run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    /// Connections are never opened beyond this count.
    pub max_connections: usize,
    /// Connections opened at start, and the floor kept in the second half.
    pub initial_connections: usize,
    /// Fixed test duration.
    pub duration: Duration,
    /// Sampling tick.
    pub tick: Duration,
    /// Bytes per second one connection is expected to carry.
    pub scaling_ratio: f64,
    /// Bytes requested (download) or sent (upload) per connection.
    pub transfer_size: u64,
    /// Auto-close deadline of the concurrent loaded-latency probe.
    pub loaded_probe_timeout: Duration,
}

impl EngineParams {
    pub fn download() -> Self {
        Self {
            max_connections: 24,
            initial_connections: 4,
            duration: Duration::from_secs(15),
            tick: Duration::from_millis(750),
            scaling_ratio: 750_000.0,
            transfer_size: 25_000_000,
            loaded_probe_timeout: Duration::from_secs(15),
        }
    }

    pub fn upload() -> Self {
        Self { max_connections: 6, ..Self::download() }
    }
}

/// Units the caller wants results in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Units {
    pub distance: DistanceUnit,
    pub download: SpeedUnit,
    pub upload: SpeedUnit,
}

impl Default for Units {
    fn default() -> Self {
        Self {
            distance: DistanceUnit::Miles,
            download: SpeedUnit::MegaBitsPerSec,
            upload: SpeedUnit::MegaBitsPerSec,
        }
    }
}

/// Options for a full test run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOptions {
    pub measure_download: bool,
    pub measure_upload: bool,
    pub connections: ConnectionMode,
    /// Candidates requested from the directory for ranking.
    pub servers_to_fetch: usize,
    /// Size of the ranked shortlist.
    pub shortlist_size: usize,
    /// Pin the run to one directory server instead of ranking candidates.
    pub server_id: Option<u32>,
    pub units: Units,
    pub ranking_probe: ProbeConfig,
    pub baseline_probe: ProbeConfig,
    pub download: EngineParams,
    pub upload: EngineParams,
    /// Deadline for the upload stats channel, from handshake to close.
    pub stats_listener_timeout: Duration,
    pub loaded_latency: LoadedLatencyPolicy,
    /// Decimal places for latency, jitter and speed figures.
    pub precision: u32,
    pub retry: RetryConfig,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            measure_download: true,
            measure_upload: true,
            connections: ConnectionMode::Multi,
            servers_to_fetch: 10,
            shortlist_size: 4,
            server_id: None,
            units: Units::default(),
            ranking_probe: ProbeConfig::ranking(),
            baseline_probe: ProbeConfig::baseline(),
            download: EngineParams::download(),
            upload: EngineParams::upload(),
            stats_listener_timeout: Duration::from_secs(20),
            loaded_latency: LoadedLatencyPolicy::Degrade,
            precision: 2,
            retry: RetryConfig::default(),
        }
    }
}

impl TestOptions {
    pub fn with_download(mut self, enabled: bool) -> Self {
        self.measure_download = enabled;
        self
    }

    pub fn with_upload(mut self, enabled: bool) -> Self {
        self.measure_upload = enabled;
        self
    }

    pub fn with_connections(mut self, mode: ConnectionMode) -> Self {
        self.connections = mode;
        self
    }

    pub fn with_servers_to_fetch(mut self, count: usize) -> Self {
        self.servers_to_fetch = count;
        self
    }

    pub fn with_server_id(mut self, id: Option<u32>) -> Self {
        self.server_id = id;
        self
    }

    pub fn with_units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    pub fn with_loaded_latency(mut self, policy: LoadedLatencyPolicy) -> Self {
        self.loaded_latency = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether download connections are spread over the whole shortlist.
    ///
    /// A pinned server always means a single-server test.
    pub fn is_multi_server(&self) -> bool {
        self.server_id.is_none() && self.connections == ConnectionMode::Multi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let options = TestOptions::default();
        assert!(options.measure_download);
        assert!(options.measure_upload);
        assert_eq!(options.servers_to_fetch, 10);
        assert_eq!(options.shortlist_size, 4);
        assert_eq!(options.ranking_probe.limit, ProbeLimit::Count(5));
        assert_eq!(options.baseline_probe.limit, ProbeLimit::Count(10));
        assert_eq!(options.loaded_latency, LoadedLatencyPolicy::Degrade);
        assert_eq!(options.precision, 2);
    }

    #[test]
    fn test_engine_params_defaults() {
        let download = EngineParams::download();
        assert_eq!(download.max_connections, 24);
        assert_eq!(download.initial_connections, 4);
        assert_eq!(download.duration, Duration::from_secs(15));
        assert_eq!(download.tick, Duration::from_millis(750));
        assert!((download.scaling_ratio - 750_000.0).abs() < 0.001);

        let upload = EngineParams::upload();
        assert_eq!(upload.max_connections, 6);
        assert_eq!(upload.transfer_size, 25_000_000);
    }

    #[test]
    fn test_pinned_server_is_single_server() {
        let options = TestOptions::default();
        assert!(options.is_multi_server());

        let pinned = options.clone().with_server_id(Some(1234));
        assert!(!pinned.is_multi_server());

        let single = options.with_connections(ConnectionMode::Single);
        assert!(!single.is_multi_server());
    }
}
