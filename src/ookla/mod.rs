//! speedtest.net measurement: server discovery, latency probes and the
//! adaptive throughput engine.

pub mod catalog;
pub mod client;
pub mod engine;
pub mod orchestrator;
pub mod probe;
pub mod requests;
pub mod server;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;
