//! Progress event types and callback interface.
//!
//! Defines the events emitted while a run is in flight and the callback
//! trait for receiving them.

use crate::errors::Stage;

/// Direction of a throughput measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

/// Progress events emitted during test execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The run entered a new stage.
    StageChange(Stage),
    /// A ranking candidate reported its latency.
    ServerRanked {
        /// Directory id of the candidate
        server_id: u32,
        /// Measured latency, `None` if the candidate was unreachable
        latency_ms: Option<f64>,
    },
    /// One accepted probe round trip.
    PingSample {
        /// Round-trip latency in milliseconds
        latency_ms: f64,
        /// Accepted samples so far
        current: usize,
    },
    /// One sampling tick of a throughput run.
    ThroughputTick {
        direction: Direction,
        /// Share of the test duration elapsed, 0 to 100
        percent: u8,
        /// Instantaneous bandwidth in bytes per second
        bandwidth_bps: f64,
        /// Connections in flight after the tick's scaling decision
        active_connections: usize,
    },
}

/// Callback interface for progress updates.
///
/// Implementations must be non-blocking to avoid affecting
/// measurement accuracy.
pub trait ProgressCallback: Send + Sync {
    /// Called when a progress event occurs.
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}
