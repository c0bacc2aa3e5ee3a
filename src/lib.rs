//! Internet speed tests against speedtest.net servers.
//!
//! [`ookla::orchestrator::SpeedTest`] runs the whole thing; the pieces it is
//! built from are public for callers that want a single stage.

pub mod config;
pub mod display;
pub mod errors;
pub mod ookla;
pub mod progress;
pub mod results;
pub mod retry;
pub mod stats;
pub mod units;

pub use config::TestOptions;
pub use errors::SpeedTestError;
pub use ookla::orchestrator::SpeedTest;
pub use results::TestResult;
