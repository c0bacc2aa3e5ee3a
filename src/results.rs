//! Result data structures for speed test output.
//!
//! All structures implement Serialize for JSON output. Speeds are already
//! converted to the unit carried alongside them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ookla::requests::config::ClientInfo;
use crate::ookla::server::{MeasurementServer, RankedServerSet};
use crate::units::SpeedUnit;

/// Reduced outcome of one probe session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingResult {
    /// Interquartile-mean round trip in milliseconds
    pub latency: f64,
    /// Mean absolute difference of consecutive round trips, when tracked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
    /// Accepted round trips the figures were computed from
    pub samples: usize,
}

/// Outcome of one adaptive throughput run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputResult {
    /// Trimmed-mean speed in `unit`
    pub speed: f64,
    pub unit: SpeedUnit,
    /// Latency measured while the transfers were running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_jitter: Option<f64>,
    /// Bytes counted across all sampling ticks
    pub transferred_bytes: u64,
    /// Sampling ticks that produced a bandwidth sample
    pub samples: usize,
    /// Most connections in flight at once
    pub peak_connections: usize,
    /// Wall-clock duration in seconds, one decimal
    pub elapsed_secs: f64,
    /// Servers that carried the transfers
    pub servers: Vec<MeasurementServer>,
}

/// Complete results from a speed test run.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    /// Timestamp when the test was completed
    pub timestamp: DateTime<Utc>,
    /// Client address and ISP as seen by speedtest.net
    pub client: ClientInfo,
    /// The lowest-latency server, which carried the latency tests
    pub server: MeasurementServer,
    /// The ranked shortlist the download was spread over
    pub servers: RankedServerSet,
    /// Idle latency against the best server
    pub ping: PingResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<ThroughputResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<ThroughputResult>,
    /// Duration of the whole run in seconds, one decimal
    pub total_time_secs: f64,
}
