//! Adaptive multi-connection throughput engine.
//!
//! A run opens a handful of transfer connections and samples the shared
//! byte counter on a fixed tick. During the first half of the test the
//! connection count is scaled towards `bandwidth / scaling_ratio`; during the
//! second half it is only topped back up to the initial count as transfers
//! complete. At 100% every transfer is aborted through one cancellation
//! token and the per-tick samples are reduced with [`trimmed_speed`].
//!
//! A loaded-latency probe runs against the primary server for the whole
//! test. Uploads additionally depend on the stats channel, since only the
//! server knows how many bytes it has received.

use crate::config::{EngineParams, LoadedLatencyPolicy, ProbeConfig};
use crate::ookla::probe::transport::ProbeConnector;
use crate::ookla::probe::{listen_upload_stats, probe_server, ProbeError};
use crate::ookla::server::MeasurementServer;
use crate::ookla::transfer::{ByteCounter, TransferTransport};
use crate::progress::{Direction, ProgressCallback, ProgressEvent};
use crate::results::{PingResult, ThroughputResult};
use crate::stats::{round_to, trimmed_speed};
use crate::units::{convert_speed, SpeedUnit};
use log::{debug, info, warn};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Ticks closer together than this carry no usable sample.
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum EngineError {
    /// The upload stats channel failed or never armed.
    StatsChannel(ProbeError),
    /// The loaded-latency probe failed under [`LoadedLatencyPolicy::Fail`].
    LoadedLatency(ProbeError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::StatsChannel(e) => {
                write!(f, "upload stats channel failed: {}", e)
            }
            EngineError::LoadedLatency(e) => {
                write!(f, "loaded latency probe failed: {}", e)
            }
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::StatsChannel(e) | EngineError::LoadedLatency(e) => Some(e),
        }
    }
}

/// Decides how many connections a tick opens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub initial_connections: usize,
    pub max_connections: usize,
    /// Bytes per second one connection is expected to carry.
    pub ratio: f64,
}

impl ScalingPolicy {
    pub fn from_params(params: &EngineParams) -> Self {
        Self {
            initial_connections: params.initial_connections,
            max_connections: params.max_connections,
            ratio: params.scaling_ratio,
        }
    }

    /// Connections to open at `percent` of the test, never negative and
    /// never past the cap.
    pub fn additional_connections(
        &self,
        percent: u8,
        bandwidth: f64,
        active: usize,
    ) -> usize {
        let wanted = if percent < 50 {
            let recommended = (bandwidth / self.ratio).ceil();
            if recommended.is_finite() && recommended > 0.0 {
                (recommended as usize).saturating_sub(active)
            } else {
                0
            }
        } else if percent < 100 {
            self.initial_connections.saturating_sub(active)
        } else {
            0
        };

        wanted.min(self.max_connections.saturating_sub(active))
    }
}

/// Outcome of one sampling tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub percent: u8,
    /// Bytes per second since the previous tick; `None` when the tick came
    /// too quickly to measure anything.
    pub bandwidth: Option<f64>,
}

/// Turns the byte counter into per-tick bandwidth samples.
#[derive(Debug)]
pub struct Sampler {
    start: Instant,
    last_sample: Instant,
    duration: Duration,
    samples: Vec<f64>,
    transferred: u64,
}

impl Sampler {
    pub fn new(start: Instant, duration: Duration) -> Self {
        Self {
            start,
            last_sample: start,
            duration,
            samples: Vec::new(),
            transferred: 0,
        }
    }

    pub fn tick(&mut self, now: Instant, counter: &ByteCounter) -> Tick {
        let percent = self.percent(now);
        let since_last = now.saturating_duration_since(self.last_sample);

        if since_last < MIN_SAMPLE_INTERVAL {
            return Tick { percent, bandwidth: None };
        }

        let bytes = counter.take();
        let bandwidth = bytes as f64 / since_last.as_secs_f64();

        self.transferred += bytes;
        self.last_sample = now;
        self.samples.push(bandwidth);

        Tick { percent, bandwidth: Some(bandwidth) }
    }

    /// Share of the test duration elapsed, floored and clamped to 0..=100.
    pub fn percent(&self, now: Instant) -> u8 {
        if self.duration.is_zero() {
            return 100;
        }

        let elapsed = now.saturating_duration_since(self.start);
        let percent = (elapsed.as_secs_f64() / self.duration.as_secs_f64() * 100.0).floor();
        percent.clamp(0.0, 100.0) as u8
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

/// Connection counters of one run.
#[derive(Debug)]
struct RunState {
    active: AtomicUsize,
    peak: AtomicUsize,
    per_server: Vec<AtomicUsize>,
}

impl RunState {
    fn new(servers: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            per_server: (0..servers).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Index of the server with the fewest connections; the first one on a
    /// tie.
    fn least_loaded(&self) -> usize {
        (0..self.per_server.len())
            .min_by_key(|&index| self.per_server[index].load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Holds one connection slot; releasing it is the drop.
struct ConnectionGuard {
    state: Arc<RunState>,
    server: usize,
}

impl ConnectionGuard {
    /// Take a slot on `server`, or `None` if the run is at `max`.
    fn acquire(state: &Arc<RunState>, server: usize, max: usize) -> Option<Self> {
        let previous = state
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max).then_some(active + 1)
            })
            .ok()?;

        state.peak.fetch_max(previous + 1, Ordering::SeqCst);
        state.per_server[server].fetch_add(1, Ordering::SeqCst);

        Some(Self { state: Arc::clone(state), server })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.per_server[self.server].fetch_sub(1, Ordering::SeqCst);
    }
}

/// Adaptive throughput measurement for one direction's parameters.
pub struct ThroughputEngine<T, P> {
    params: EngineParams,
    transport: Arc<T>,
    connector: Arc<P>,
    unit: SpeedUnit,
    precision: u32,
    loaded_latency: LoadedLatencyPolicy,
    stats_timeout: Duration,
    progress: Option<Arc<dyn ProgressCallback>>,
}

impl<T: TransferTransport, P: ProbeConnector> ThroughputEngine<T, P> {
    pub fn new(params: EngineParams, transport: Arc<T>, connector: Arc<P>) -> Self {
        Self {
            params,
            transport,
            connector,
            unit: SpeedUnit::MegaBitsPerSec,
            precision: 2,
            loaded_latency: LoadedLatencyPolicy::default(),
            stats_timeout: Duration::from_secs(20),
            progress: None,
        }
    }

    pub fn with_unit(mut self, unit: SpeedUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_loaded_latency(mut self, policy: LoadedLatencyPolicy) -> Self {
        self.loaded_latency = policy;
        self
    }

    pub fn with_stats_timeout(mut self, stats_timeout: Duration) -> Self {
        self.stats_timeout = stats_timeout;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Measure download speed.
    ///
    /// With more than one server connections are spread over all of them,
    /// least-loaded first; otherwise every connection goes to `primary`.
    pub async fn measure_download(
        &self,
        servers: &[MeasurementServer],
        primary: &MeasurementServer,
        session_id: &str,
    ) -> Result<ThroughputResult, EngineError> {
        let pool = if servers.is_empty() {
            vec![primary.clone()]
        } else {
            servers.to_vec()
        };

        info!(
            "Measuring download against {} server(s), primary {}",
            pool.len(),
            primary.host
        );

        let counter = ByteCounter::default();
        let mut run = Run::new(self, Direction::Download, pool, session_id, counter);

        if run.pool.len() > 1 {
            for index in 0..run.pool.len() {
                run.open(index);
            }
        } else {
            for _ in 0..self.params.initial_connections {
                run.open(0);
            }
        }

        self.finish(run, primary, session_id).await
    }

    /// Measure upload speed against `primary`.
    ///
    /// Bytes are counted from the server's stats reports, so the stats
    /// channel must arm before any upload starts.
    pub async fn measure_upload(
        &self,
        primary: &MeasurementServer,
        session_id: &str,
    ) -> Result<ThroughputResult, EngineError> {
        info!("Measuring upload against {}", primary.host);

        let counter = ByteCounter::default();
        let stats_stop = CancellationToken::new();
        let (ready, stats) =
            self.spawn_stats_listener(primary, session_id, &counter, &stats_stop);

        match timeout(self.stats_timeout, ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                stats_stop.cancel();
                let error = match stats.await {
                    Ok(Err(e)) => e,
                    _ => ProbeError::StatsNotArmed,
                };
                return Err(EngineError::StatsChannel(error));
            }
        }

        let mut run = Run::new(
            self,
            Direction::Upload,
            vec![primary.clone()],
            session_id,
            counter,
        );
        for _ in 0..self.params.initial_connections {
            run.open(0);
        }

        let result = self.finish(run, primary, session_id).await;

        stats_stop.cancel();
        match stats.await {
            Ok(Err(e)) => debug!("Upload stats channel ended with error: {}", e),
            Err(e) => debug!("Upload stats task failed: {}", e),
            Ok(Ok(())) => {}
        }

        result
    }

    fn spawn_stats_listener(
        &self,
        primary: &MeasurementServer,
        session_id: &str,
        counter: &ByteCounter,
        stop: &CancellationToken,
    ) -> (oneshot::Receiver<()>, JoinHandle<Result<(), ProbeError>>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let connector = Arc::clone(&self.connector);
        let host = primary.host.clone();
        let token = session_id.to_string();
        let deadline = self.stats_timeout;
        let counter = counter.clone();
        let stop = stop.clone();

        let handle = tokio::spawn(async move {
            let socket = timeout(deadline, connector.connect(&host))
                .await
                .map_err(|_| ProbeError::ConnectTimeout(deadline))??;

            listen_upload_stats(
                socket,
                &token,
                deadline,
                |bytes| counter.add(bytes),
                ready_tx,
                &stop,
            )
            .await
        });

        (ready_rx, handle)
    }

    fn spawn_loaded_probe(
        &self,
        primary: &MeasurementServer,
        session_id: &str,
        stop: &CancellationToken,
    ) -> JoinHandle<Result<PingResult, ProbeError>> {
        let connector = Arc::clone(&self.connector);
        let host = primary.host.clone();
        let token = session_id.to_string();
        let config = ProbeConfig::loaded(self.params.loaded_probe_timeout);
        let precision = self.precision;
        let stop = stop.clone();

        tokio::spawn(async move {
            probe_server(&*connector, &host, Some(&token), &config, precision, &stop, None)
                .await
        })
    }

    /// Sample until 100%, then tear everything down and reduce.
    async fn finish(
        &self,
        mut run: Run<'_, T, P>,
        primary: &MeasurementServer,
        session_id: &str,
    ) -> Result<ThroughputResult, EngineError> {
        let probe_stop = CancellationToken::new();
        let probe = self.spawn_loaded_probe(primary, session_id, &probe_stop);

        let sampler = run.sample().await;
        run.abort().await;

        probe_stop.cancel();
        let loaded = match probe.await {
            Ok(Ok(ping)) => Some(ping),
            Ok(Err(e)) => self.loaded_probe_failed(e)?,
            Err(e) => self.loaded_probe_failed(ProbeError::Connect(e.to_string()))?,
        };

        let bytes_per_second = trimmed_speed(sampler.samples());
        let speed = round_to(
            convert_speed(bytes_per_second, SpeedUnit::BytesPerSec, self.unit),
            self.precision,
        );

        info!(
            "{} finished: {} {} over {} samples",
            run.direction.label(),
            speed,
            self.unit,
            sampler.samples().len()
        );

        Ok(ThroughputResult {
            speed,
            unit: self.unit,
            loaded_latency: loaded.as_ref().map(|ping| ping.latency),
            loaded_jitter: loaded.as_ref().and_then(|ping| ping.jitter),
            transferred_bytes: sampler.transferred(),
            samples: sampler.samples().len(),
            peak_connections: run.state.peak.load(Ordering::SeqCst),
            elapsed_secs: round_to(run.started.elapsed().as_secs_f64(), 1),
            servers: run.pool,
        })
    }

    fn loaded_probe_failed(&self, error: ProbeError) -> Result<Option<PingResult>, EngineError> {
        match self.loaded_latency {
            LoadedLatencyPolicy::Degrade => {
                warn!("Loaded latency unavailable: {}", error);
                Ok(None)
            }
            LoadedLatencyPolicy::Fail => Err(EngineError::LoadedLatency(error)),
        }
    }
}

/// Mutable state of one throughput run.
struct Run<'a, T, P> {
    engine: &'a ThroughputEngine<T, P>,
    direction: Direction,
    pool: Vec<MeasurementServer>,
    session_id: Arc<str>,
    counter: ByteCounter,
    state: Arc<RunState>,
    abort: CancellationToken,
    tasks: JoinSet<()>,
    started: Instant,
}

impl<'a, T: TransferTransport, P: ProbeConnector> Run<'a, T, P> {
    fn new(
        engine: &'a ThroughputEngine<T, P>,
        direction: Direction,
        pool: Vec<MeasurementServer>,
        session_id: &str,
        counter: ByteCounter,
    ) -> Self {
        let state = Arc::new(RunState::new(pool.len()));
        Self {
            engine,
            direction,
            pool,
            session_id: Arc::from(session_id),
            counter,
            state,
            abort: CancellationToken::new(),
            tasks: JoinSet::new(),
            started: Instant::now(),
        }
    }

    /// Open one connection to `self.pool[server]`. Refused at the cap.
    fn open(&mut self, server: usize) -> bool {
        let max = self.engine.params.max_connections;
        let Some(guard) = ConnectionGuard::acquire(&self.state, server, max) else {
            return false;
        };

        let transport = Arc::clone(&self.engine.transport);
        let target = self.pool[server].clone();
        let guid = Arc::clone(&self.session_id);
        let size = self.engine.params.transfer_size;
        let counter = self.counter.clone();
        let abort = self.abort.clone();
        let direction = self.direction;

        self.tasks.spawn(async move {
            let _guard = guard;
            let transfer = async {
                match direction {
                    Direction::Download => {
                        transport.download(&target, size, &guid, &counter).await
                    }
                    Direction::Upload => transport.upload(&target, size, &guid).await,
                }
            };

            tokio::select! {
                _ = abort.cancelled() => {}
                result = transfer => match result {
                    Ok(()) => debug!("{} connection to {} completed", direction.label(), target.host),
                    Err(e) => debug!("{} connection to {} ended: {}", direction.label(), target.host, e),
                },
            }
        });

        true
    }

    /// Server for the next connection.
    fn next_server(&self) -> usize {
        if self.pool.len() > 1 {
            self.state.least_loaded()
        } else {
            0
        }
    }

    async fn sample(&mut self) -> Sampler {
        let engine = self.engine;
        let params = &engine.params;
        let policy = ScalingPolicy::from_params(params);
        let mut sampler = Sampler::new(self.started, params.duration);

        let mut ticker = interval_at(self.started + params.tick, params.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // Reap finished transfers so the set does not grow unbounded.
            while self.tasks.try_join_next().is_some() {}

            let tick = sampler.tick(Instant::now(), &self.counter);

            if let Some(bandwidth) = tick.bandwidth {
                if tick.percent < 100 {
                    let wanted = policy.additional_connections(
                        tick.percent,
                        bandwidth,
                        self.state.active(),
                    );
                    for _ in 0..wanted {
                        let server = self.next_server();
                        if !self.open(server) {
                            break;
                        }
                    }
                }

                if let Some(progress) = &engine.progress {
                    progress.on_progress(ProgressEvent::ThroughputTick {
                        direction: self.direction,
                        percent: tick.percent,
                        bandwidth_bps: bandwidth,
                        active_connections: self.state.active(),
                    });
                }
            }

            if tick.percent >= 100 {
                return sampler;
            }
        }
    }

    /// Cancel every transfer and wait until all of them have let go of
    /// their slots.
    async fn abort(&mut self) {
        self.abort.cancel();
        while self.tasks.join_next().await.is_some() {}
        debug!(
            "{} transfers aborted, {} still active",
            self.direction.label(),
            self.state.active()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ookla::server::tests::server;
    use crate::ookla::testing::{MockConnector, MockTransfer};
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn engine(
        params: EngineParams,
        transfer: &Arc<MockTransfer>,
        connector: MockConnector,
    ) -> ThroughputEngine<MockTransfer, MockConnector> {
        ThroughputEngine::new(params, Arc::clone(transfer), Arc::new(connector))
            .with_unit(SpeedUnit::BytesPerSec)
    }

    #[test]
    fn test_scaling_first_half_targets_bandwidth() {
        let policy = ScalingPolicy::from_params(&EngineParams::download());

        // ceil(6.2 MB/s / 750 kB/s) = 9 connections.
        assert_eq!(policy.additional_connections(10, 6_200_000.0, 4), 5);
        assert_eq!(policy.additional_connections(49, 6_200_000.0, 9), 0);
        assert_eq!(policy.additional_connections(10, 100.0, 4), 0);
    }

    #[test]
    fn test_scaling_second_half_tops_up_to_initial() {
        let policy = ScalingPolicy::from_params(&EngineParams::download());

        assert_eq!(policy.additional_connections(50, 90_000_000.0, 2), 2);
        assert_eq!(policy.additional_connections(75, 0.0, 10), 0);
        assert_eq!(policy.additional_connections(100, 90_000_000.0, 0), 0);
    }

    #[test]
    fn test_scaling_respects_the_cap() {
        let policy = ScalingPolicy::from_params(&EngineParams::upload());
        assert_eq!(policy.additional_connections(5, 1e12, 4), 2);
    }

    #[test]
    fn test_sampler_percent_is_floored_and_clamped() {
        let start = Instant::now();
        let sampler = Sampler::new(start, Duration::from_secs(10));

        assert_eq!(sampler.percent(start), 0);
        assert_eq!(sampler.percent(start + Duration::from_millis(4_999)), 49);
        assert_eq!(sampler.percent(start + Duration::from_secs(5)), 50);
        assert_eq!(sampler.percent(start + Duration::from_secs(30)), 100);
    }

    #[test]
    fn test_sampler_skips_zero_interval_ticks() {
        let start = Instant::now();
        let mut sampler = Sampler::new(start, Duration::from_secs(10));
        let counter = ByteCounter::default();

        counter.add(1_000);
        assert_eq!(sampler.tick(start, &counter).bandwidth, None);

        let tick = sampler.tick(start + Duration::from_millis(500), &counter);
        assert_eq!(tick.bandwidth, Some(2_000.0));
        assert_eq!(sampler.transferred(), 1_000);
    }

    #[test]
    fn test_least_loaded_prefers_first_on_tie() {
        let state = Arc::new(RunState::new(3));
        let _a = ConnectionGuard::acquire(&state, 0, 10);
        assert_eq!(state.least_loaded(), 1);

        let _b = ConnectionGuard::acquire(&state, 1, 10);
        let _c = ConnectionGuard::acquire(&state, 2, 10);
        assert_eq!(state.least_loaded(), 0);
    }

    #[test]
    fn test_guard_refuses_at_cap_and_releases_on_drop() {
        let state = Arc::new(RunState::new(1));
        let first = ConnectionGuard::acquire(&state, 0, 1);
        assert!(first.is_some());
        assert!(ConnectionGuard::acquire(&state, 0, 1).is_none());

        drop(first);
        assert_eq!(state.active(), 0);
        assert_eq!(state.per_server[0].load(Ordering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn prop_scaling_never_exceeds_cap(
            percent in 0u8..=100,
            bandwidth in 0.0f64..1e10,
            active in 0usize..40,
        ) {
            let policy = ScalingPolicy::from_params(&EngineParams::download());
            let opened = policy.additional_connections(percent, bandwidth, active);
            prop_assert!(active + opened <= policy.max_connections.max(active));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_converges_on_link_rate() {
        let transfer = Arc::new(MockTransfer::new(6_000_000));
        let engine = engine(EngineParams::download(), &transfer, MockConnector::default());
        let primary = server(1, Some(5.0));

        let result = engine
            .measure_download(&[primary.clone()], &primary, "session")
            .await
            .unwrap();

        assert!(
            (result.speed - 6_000_000.0).abs() <= 6_000_000.0 * 0.05,
            "speed {} too far from the link rate",
            result.speed
        );
        assert_eq!(result.samples, 20);
        // Roughly ceil(6 MB/s / 750 kB/s) connections carry the link.
        assert!((8..=10).contains(&result.peak_connections));
        assert_eq!(result.loaded_latency, Some(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_transfers_stop_counting() {
        let transfer = Arc::new(MockTransfer::new(2_000_000));
        let engine = engine(EngineParams::download(), &transfer, MockConnector::default());
        let primary = server(1, None);

        engine.measure_download(&[], &primary, "session").await.unwrap();

        assert_eq!(transfer.active(), 0);
        let emitted = transfer.emitted();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transfer.emitted(), emitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_server_spreads_least_loaded() {
        let transfer = Arc::new(MockTransfer::new(12_000_000));
        let engine = engine(EngineParams::download(), &transfer, MockConnector::default());
        let servers: Vec<_> = (1..=4).map(|id| server(id, Some(id as f64))).collect();

        let result = engine
            .measure_download(&servers, &servers[0], "session")
            .await
            .unwrap();

        assert_eq!(result.servers.len(), 4);
        let per_host = transfer.opened_per_host();
        let counts: Vec<usize> = servers
            .iter()
            .map(|s| per_host.get(&s.host).copied().unwrap_or(0))
            .collect();
        let (min, max) = (
            counts.iter().copied().min().unwrap_or(0),
            counts.iter().copied().max().unwrap_or(0),
        );
        assert!(min >= 1);
        assert!(max - min <= 1, "unbalanced spread {:?}", counts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_cap_is_never_exceeded() {
        let transfer = Arc::new(MockTransfer::new(1_000_000_000));
        let engine = engine(EngineParams::upload(), &transfer, MockConnector::default());
        let primary = server(1, None);

        let result = engine.measure_download(&[], &primary, "session").await.unwrap();

        assert_eq!(result.peak_connections, 6);
        assert!(transfer.peak_active() <= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transfers_yield_zero_speed() {
        let transfer = Arc::new(MockTransfer::failing());
        let engine = engine(EngineParams::download(), &transfer, MockConnector::default());
        let primary = server(1, None);

        let result = engine.measure_download(&[], &primary, "session").await.unwrap();

        assert_eq!(result.speed, 0.0);
        assert_eq!(result.transferred_bytes, 0);
        assert_eq!(result.samples, 20);
        assert!(transfer.opened() >= EngineParams::download().initial_connections);
        assert_eq!(transfer.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_loaded_probe_degrades() {
        let transfer = Arc::new(MockTransfer::new(1_000_000));
        let primary = server(1, None);
        let connector = MockConnector::default().refusing(&primary.host);
        let engine = engine(EngineParams::download(), &transfer, connector);

        let result = engine.measure_download(&[], &primary, "session").await.unwrap();

        assert!(result.speed > 0.0);
        assert_eq!(result.loaded_latency, None);
        assert_eq!(result.loaded_jitter, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_loaded_probe_fails_when_strict() {
        let transfer = Arc::new(MockTransfer::new(1_000_000));
        let primary = server(1, None);
        let connector = MockConnector::default().refusing(&primary.host);
        let engine = engine(EngineParams::download(), &transfer, connector)
            .with_loaded_latency(LoadedLatencyPolicy::Fail);

        let result = engine.measure_download(&[], &primary, "session").await;

        assert!(matches!(result, Err(EngineError::LoadedLatency(_))));
        assert_eq!(transfer.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_counts_server_reported_bytes() {
        let transfer = Arc::new(MockTransfer::new(3_000_000));
        let connector = MockConnector::default().with_upload_stats(transfer.delivered());
        let engine = engine(EngineParams::upload(), &transfer, connector);
        let primary = server(1, Some(5.0));

        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        let engine = engine.with_progress(Arc::new(move |event: ProgressEvent| {
            if let ProgressEvent::ThroughputTick { percent, .. } = event {
                sink.lock().unwrap().push(percent);
            }
        }));

        let result = engine.measure_upload(&primary, "session").await.unwrap();

        assert!(
            (result.speed - 3_000_000.0).abs() <= 3_000_000.0 * 0.1,
            "speed {} too far from the link rate",
            result.speed
        );
        assert_eq!(transfer.active(), 0);

        let ticks = ticks.lock().unwrap();
        assert_eq!(ticks.last(), Some(&100));
        assert!(ticks.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_fails_when_stats_never_arm() {
        let transfer = Arc::new(MockTransfer::new(3_000_000));
        // Without stats support the mock socket never acknowledges.
        let engine = engine(EngineParams::upload(), &transfer, MockConnector::default())
            .with_stats_timeout(Duration::from_secs(2));
        let primary = server(1, None);

        let result = engine.measure_upload(&primary, "session").await;

        assert!(matches!(result, Err(EngineError::StatsChannel(_))));
        assert_eq!(transfer.opened(), 0);
    }
}
