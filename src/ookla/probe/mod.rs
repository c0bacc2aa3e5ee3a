//! The latency probe channel.
//!
//! A probe session speaks the speedtest.net line protocol over a WebSocket:
//! after the `HI`/`GETIP`/`CAPABILITIES` handshake it sends `PING <ts>` and
//! times each `PONG`. The first pong only confirms the channel and is
//! discarded. The same channel, opened with `UPLOAD_STATS`, reports how many
//! bytes the server has received during an upload test.

pub mod transport;

use crate::config::{ProbeConfig, ProbeLimit};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::results::PingResult;
use crate::stats::{average, interquartile_mean};
use log::{debug, trace};
use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use transport::{ProbeConnector, ProbeSocket};

/// Subscription sent to the stats channel: report every 50ms for 15s.
const UPLOAD_STATS_REQUEST: &str = "UPLOAD_STATS 15000 50 0";

#[derive(Debug)]
pub enum ProbeError {
    /// The WebSocket layer failed.
    Channel(tokio_tungstenite::tungstenite::Error),
    /// The channel could not be opened for another reason.
    Connect(String),
    /// Opening the channel took longer than the probe deadline.
    ConnectTimeout(Duration),
    /// The session ended without a single accepted round trip.
    NoSamples,
    /// The stats channel closed before the server acknowledged it.
    StatsNotArmed,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Channel(e) => write!(f, "probe channel error: {}", e),
            ProbeError::Connect(reason) => {
                write!(f, "could not open probe channel: {}", reason)
            }
            ProbeError::ConnectTimeout(after) => {
                write!(f, "probe channel timed out after {:?}", after)
            }
            ProbeError::NoSamples => f.write_str("no latency samples were collected"),
            ProbeError::StatsNotArmed => {
                f.write_str("upload stats channel closed before it was armed")
            }
        }
    }
}

impl Error for ProbeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProbeError::Channel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProbeError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        ProbeError::Channel(error)
    }
}

/// Where a probe session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Connecting,
    /// Handshake sent; the next pong is discarded.
    AwaitingFirstPong,
    /// Ping number `n` (1-based) is in flight.
    Pinging(usize),
    /// The limit was reached and the channel should be closed.
    Closing,
    Closed,
}

/// What the driver should do after a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeAction {
    Send(String),
    Close,
    Ignore,
}

/// Transport-free ping session.
///
/// The caller feeds it received lines with their arrival instant and writes
/// out whatever it asks to send.
#[derive(Debug)]
pub struct PingSession {
    limit: ProbeLimit,
    track_jitter: bool,
    state: ProbeState,
    sent_at: Option<Instant>,
    latencies: Vec<f64>,
    jitters: Vec<f64>,
}

impl PingSession {
    pub fn new(limit: ProbeLimit, track_jitter: bool) -> Self {
        Self {
            limit,
            track_jitter,
            state: ProbeState::Connecting,
            sent_at: None,
            latencies: Vec::new(),
            jitters: Vec::new(),
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Accepted round trips in milliseconds, in arrival order.
    pub fn latencies(&self) -> &[f64] {
        &self.latencies
    }

    /// Lines to send once the channel is open. The trailing ping is the one
    /// whose pong gets discarded.
    pub fn open(&mut self, token: Option<&str>, now: Instant) -> Vec<String> {
        let mut lines = Vec::with_capacity(4);
        if let Some(token) = token {
            lines.push(format!("HI {}", token));
        }
        lines.push("GETIP".to_string());
        lines.push("CAPABILITIES".to_string());
        lines.push(ping_line());

        self.state = ProbeState::AwaitingFirstPong;
        self.sent_at = Some(now);
        lines
    }

    /// Handle one received line.
    pub fn on_message(&mut self, message: &str, now: Instant) -> ProbeAction {
        if !message.contains("PONG") {
            trace!("Ignoring probe message {:?}", message);
            return ProbeAction::Ignore;
        }

        match self.state {
            ProbeState::AwaitingFirstPong => {}
            ProbeState::Pinging(_) => self.record(now),
            _ => return ProbeAction::Ignore,
        }

        if let ProbeLimit::Count(limit) = self.limit {
            if self.latencies.len() >= limit {
                self.state = ProbeState::Closing;
                return ProbeAction::Close;
            }
        }

        self.state = ProbeState::Pinging(self.latencies.len() + 1);
        self.sent_at = Some(now);
        ProbeAction::Send(ping_line())
    }

    fn record(&mut self, now: Instant) {
        let Some(sent_at) = self.sent_at else {
            return;
        };

        let latency = (now - sent_at).as_micros() as f64 / 1000.0;
        if self.track_jitter {
            if let Some(previous) = self.latencies.last() {
                self.jitters.push((latency - previous).abs());
            }
        }
        self.latencies.push(latency);
    }

    pub fn close(&mut self) {
        self.state = ProbeState::Closed;
    }

    /// Reduce the session: interquartile-mean latency, plain-mean jitter.
    pub fn finish(&self, precision: u32) -> Result<PingResult, ProbeError> {
        let latency = interquartile_mean(&self.latencies, Some(precision))
            .ok_or(ProbeError::NoSamples)?;

        let jitter = if self.track_jitter {
            average(&self.jitters, Some(precision))
        } else {
            None
        };

        Ok(PingResult { latency, jitter, samples: self.latencies.len() })
    }
}

fn ping_line() -> String {
    format!("PING {}", chrono::Utc::now().timestamp_millis())
}

/// Drive a ping session over an open socket until the limit, the deadline
/// or `stop` ends it.
pub async fn measure_ping<S: ProbeSocket>(
    mut socket: S,
    token: Option<&str>,
    config: &ProbeConfig,
    precision: u32,
    stop: &CancellationToken,
    progress: Option<&dyn ProgressCallback>,
) -> Result<PingResult, ProbeError> {
    let mut session = PingSession::new(config.limit, config.track_jitter);
    let deadline = Instant::now() + config.timeout;

    for line in session.open(token, Instant::now()) {
        socket.send(line).await?;
    }

    loop {
        let message = tokio::select! {
            _ = sleep_until(deadline) => {
                debug!("Probe session auto-closed after {:?}", config.timeout);
                break;
            }
            _ = stop.cancelled() => break,
            message = socket.recv() => message,
        };

        let Some(message) = message else {
            debug!("Probe channel closed by server");
            break;
        };

        let received = session.latencies().len();
        let action = session.on_message(&message?, Instant::now());

        if let (Some(progress), Some(&latency_ms)) =
            (progress, session.latencies().get(received))
        {
            progress.on_progress(ProgressEvent::PingSample {
                latency_ms,
                current: received + 1,
            });
        }

        match action {
            ProbeAction::Send(line) => socket.send(line).await?,
            ProbeAction::Close => break,
            ProbeAction::Ignore => {}
        }
    }

    socket.close().await;
    session.close();
    session.finish(precision)
}

/// Connect to `host` and run one ping session, bounded by the probe timeout.
pub async fn probe_server<P: ProbeConnector>(
    connector: &P,
    host: &str,
    token: Option<&str>,
    config: &ProbeConfig,
    precision: u32,
    stop: &CancellationToken,
    progress: Option<&dyn ProgressCallback>,
) -> Result<PingResult, ProbeError> {
    let socket = timeout(config.timeout, connector.connect(host))
        .await
        .map_err(|_| ProbeError::ConnectTimeout(config.timeout))??;

    measure_ping(socket, token, config, precision, stop, progress).await
}

/// One parsed message from the upload stats channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsEvent {
    /// The server acknowledged the subscription.
    Armed,
    /// Bytes received by the server since the previous report.
    Delivered(u64),
    Ignored,
}

#[derive(Deserialize)]
struct UploadStats {
    #[serde(default)]
    b: Option<f64>,
}

/// Turns cumulative `{"b": total}` reports into deltas.
#[derive(Debug, Default)]
pub struct StatsTracker {
    previous: u64,
}

impl StatsTracker {
    pub fn on_message(&mut self, message: &str) -> StatsEvent {
        if !message.trim_start().starts_with('{') {
            return StatsEvent::Ignored;
        }

        let stats: UploadStats = match serde_json::from_str(message) {
            Ok(stats) => stats,
            Err(e) => {
                debug!("Ignoring malformed upload stats {:?}: {}", message, e);
                return StatsEvent::Ignored;
            }
        };

        match stats.b.map(|b| b.max(0.0) as u64) {
            None | Some(0) => StatsEvent::Armed,
            Some(total) => {
                let delta = total.saturating_sub(self.previous);
                self.previous = total;
                StatsEvent::Delivered(delta)
            }
        }
    }
}

/// Run the upload stats channel on an open socket.
///
/// `ready` fires once the server acknowledges the subscription; every later
/// report feeds `on_delivered`. Runs until `stop`, the deadline, or the
/// server closing the channel.
pub async fn listen_upload_stats<S, F>(
    mut socket: S,
    token: &str,
    deadline: Duration,
    mut on_delivered: F,
    ready: oneshot::Sender<()>,
    stop: &CancellationToken,
) -> Result<(), ProbeError>
where
    S: ProbeSocket,
    F: FnMut(u64) + Send,
{
    let mut ready = Some(ready);
    let mut tracker = StatsTracker::default();
    let deadline = Instant::now() + deadline;

    socket.send(format!("HI {}", token)).await?;
    socket.send(UPLOAD_STATS_REQUEST.to_string()).await?;

    loop {
        let message = tokio::select! {
            _ = sleep_until(deadline) => break,
            _ = stop.cancelled() => break,
            message = socket.recv() => message,
        };

        let Some(message) = message else { break };

        match tracker.on_message(&message?) {
            StatsEvent::Armed => {
                if let Some(ready) = ready.take() {
                    debug!("Upload stats channel armed");
                    let _ = ready.send(());
                }
            }
            StatsEvent::Delivered(bytes) => on_delivered(bytes),
            StatsEvent::Ignored => {}
        }
    }

    socket.close().await;

    if ready.is_some() {
        return Err(ProbeError::StatsNotArmed);
    }
    Ok(())
}
