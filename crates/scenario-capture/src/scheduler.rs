//! Capture Scheduler

use crate::scenario::ScenarioSpec;
use crate::session::{
    Reading, SampleBatch, ScenarioResult, SessionMetadata, SessionStats, TickKind,
};
use async_trait::async_trait;
use chrono::Utc;
use ecu_connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use obd_transport::PidSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A recorder failure. Recording is best-effort: the scheduler logs these
/// and keeps capturing.
#[derive(Debug, Error)]
#[error("recorder failure: {0}")]
pub struct SinkError(pub String);

/// Receives finished scenarios and the final session metadata
#[async_trait]
pub trait ScenarioSink: Send {
    async fn record_scenario(&mut self, result: &ScenarioResult) -> Result<(), SinkError>;
    async fn record_metadata(&mut self, metadata: &SessionMetadata) -> Result<(), SinkError>;
}

/// Discards everything
pub struct NullSink;

#[async_trait]
impl ScenarioSink for NullSink {
    async fn record_scenario(&mut self, _result: &ScenarioResult) -> Result<(), SinkError> {
        Ok(())
    }

    async fn record_metadata(&mut self, _metadata: &SessionMetadata) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Blocks the session until the operator has set up the next scenario
#[async_trait]
pub trait OperatorGate: Send {
    async fn wait_ready(&mut self, spec: &ScenarioSpec);
}

/// Proceeds immediately; for unattended runs
pub struct AutoGate;

#[async_trait]
impl OperatorGate for AutoGate {
    async fn wait_ready(&mut self, _spec: &ScenarioSpec) {}
}

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Ticks per second; every monitored parameter is read once per tick
    pub sampling_rate_hz: f64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 1.0,
        }
    }
}

enum ScenarioExit {
    Completed,
    Stopped,
    ConnectionFailed,
}

enum EventOutcome {
    Continue,
    Stopped,
    Fatal,
}

/// Drives a session of scenarios against a live connection
pub struct ScenarioScheduler {
    options: CaptureOptions,
}

impl ScenarioScheduler {
    pub fn new(options: CaptureOptions) -> Self {
        Self { options }
    }

    /// Run every scenario in the plan in order. Ends early when the stop
    /// signal fires, when the connection fails terminally, or when the
    /// operator gate is abandoned; the metadata records which.
    pub async fn run_session(
        &self,
        manager: &ConnectionManager,
        pid_set: &PidSet,
        plan: &[ScenarioSpec],
        gate: &mut dyn OperatorGate,
        sink: &mut dyn ScenarioSink,
        mut stop: watch::Receiver<bool>,
    ) -> SessionMetadata {
        let session_id = Uuid::new_v4();
        info!(
            %session_id,
            rate_hz = self.options.sampling_rate_hz,
            pids = pid_set.len(),
            scenarios = plan.len(),
            "starting capture session"
        );

        let mut events = manager.subscribe();
        let mut metadata = SessionMetadata {
            session_id,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            sampling_rate_hz: self.options.sampling_rate_hz,
            protocol: manager.info().await.map(|i| i.protocol),
            monitored_pids: pid_set.ids(),
            scenarios: Vec::new(),
            stats: SessionStats::default(),
            terminated_early: false,
        };

        for spec in plan {
            if *stop.borrow() || manager.state().is_terminal() {
                metadata.terminated_early = true;
                break;
            }

            if spec.requires_operator_prompt {
                info!(scenario = %spec.name, "waiting for operator");
                tokio::select! {
                    _ = gate.wait_ready(spec) => {}
                    _ = stopped(&mut stop) => {
                        info!("stop requested while waiting for operator");
                        metadata.terminated_early = true;
                        break;
                    }
                }
            }

            let (result, exit) = self
                .run_scenario(manager, pid_set, spec, &mut events, &mut stop)
                .await;

            metadata.stats.total_samples += u64::from(result.sampled_ticks());
            metadata.stats.failed_samples += u64::from(result.failed_sample_count);
            metadata.stats.reconnections += result.reconnection_count;
            metadata.scenarios.push(result.summary());

            if let Err(e) = sink.record_scenario(&result).await {
                error!(scenario = %spec.name, error = %e, "failed to record scenario");
            }

            match exit {
                ScenarioExit::Completed => {}
                ScenarioExit::Stopped => {
                    metadata.terminated_early = true;
                    break;
                }
                ScenarioExit::ConnectionFailed => {
                    warn!("connection failed terminally; ending session early");
                    metadata.terminated_early = true;
                    break;
                }
            }
        }

        metadata.ended_at = Utc::now();
        if let Err(e) = sink.record_metadata(&metadata).await {
            error!(error = %e, "failed to record session metadata");
        }
        info!(
            %session_id,
            scenarios = metadata.scenarios.len(),
            samples = metadata.stats.total_samples,
            reconnections = metadata.stats.reconnections,
            terminated_early = metadata.terminated_early,
            "capture session finished"
        );
        metadata
    }

    async fn run_scenario(
        &self,
        manager: &ConnectionManager,
        pid_set: &PidSet,
        spec: &ScenarioSpec,
        events: &mut broadcast::Receiver<ConnectionEvent>,
        stop: &mut watch::Receiver<bool>,
    ) -> (ScenarioResult, ScenarioExit) {
        let period = Duration::from_secs_f64(1.0 / self.options.sampling_rate_hz);
        let total_ticks =
            ((spec.duration.as_secs_f64() * self.options.sampling_rate_hz).round() as u32).max(1);

        // Events from before this scenario belong to whoever was sampling
        // then; act only on what happens from here on
        while events.try_recv().is_ok() {}
        let mut prev_state = manager.state();
        let mut paused = !prev_state.can_query();

        let mut result = ScenarioResult::new(spec.clone(), pid_set.ids());
        if paused {
            result.open_pause(prev_state, 0);
        }

        info!(
            scenario = %spec.name,
            duration_s = spec.duration.as_secs(),
            ticks = total_ticks,
            "scenario started"
        );
        let started = Instant::now();
        result.started_at = Utc::now();

        let mut ticker = tokio::time::interval(period);
        let mut tick: u32 = 0;
        let exit = loop {
            if tick >= total_ticks {
                break ScenarioExit::Completed;
            }

            tokio::select! {
                biased;

                _ = stopped(stop) => {
                    info!(scenario = %spec.name, tick, "stop requested; finalizing scenario");
                    result.truncated = true;
                    break ScenarioExit::Stopped;
                }

                event = events.recv() => match event {
                    Ok(event) => {
                        match apply_event(&event, &mut result, &mut paused, &mut prev_state, tick) {
                            EventOutcome::Continue => {}
                            EventOutcome::Stopped => {
                                result.truncated = true;
                                break ScenarioExit::Stopped;
                            }
                            EventOutcome::Fatal => {
                                result.truncated = true;
                                break ScenarioExit::ConnectionFailed;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event stream lagged; resynchronizing from current state");
                        prev_state = manager.state();
                        paused = !prev_state.can_query();
                        if !paused {
                            result.close_pause(tick);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        result.truncated = true;
                        break ScenarioExit::Stopped;
                    }
                },

                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    if paused {
                        result.batches.push(SampleBatch::skipped(tick, elapsed));
                    } else {
                        let batch = self
                            .sample_batch(manager, pid_set, tick, elapsed, &mut result.failed_sample_count)
                            .await;
                        result.batches.push(batch);
                    }
                    tick += 1;
                }
            }
        };

        result.close_pause(tick);
        result.ended_at = Utc::now();
        info!(
            scenario = %spec.name,
            sampled = result.sampled_ticks(),
            skipped = result.skipped_ticks(),
            failed_readings = result.failed_sample_count,
            reconnections = result.reconnection_count,
            truncated = result.truncated,
            "scenario finished"
        );
        (result, exit)
    }

    /// Read every monitored parameter once. Individual failures become
    /// invalid readings; the tick itself always lands.
    async fn sample_batch(
        &self,
        manager: &ConnectionManager,
        pid_set: &PidSet,
        tick: u32,
        elapsed: Duration,
        failed: &mut u32,
    ) -> SampleBatch {
        let mut readings = Vec::with_capacity(pid_set.len());
        for pid in pid_set.iter() {
            match manager.query(pid).await {
                Ok(value) => readings.push(Reading {
                    pid_id: value.pid_id,
                    timestamp: value.timestamp,
                    value: Some(value.value),
                    valid: true,
                }),
                Err(e) => {
                    debug!(pid = %pid.id, tick, error = %e, "sample failed");
                    *failed += 1;
                    readings.push(Reading {
                        pid_id: pid.id.clone(),
                        timestamp: Utc::now(),
                        value: None,
                        valid: false,
                    });
                }
            }
        }
        SampleBatch {
            tick,
            timestamp: Utc::now(),
            elapsed,
            kind: TickKind::Sampled,
            readings,
        }
    }
}

fn apply_event(
    event: &ConnectionEvent,
    result: &mut ScenarioResult,
    paused: &mut bool,
    prev_state: &mut ConnectionState,
    tick: u32,
) -> EventOutcome {
    match event.state {
        ConnectionState::Degraded | ConnectionState::Reconnecting => {
            if event.state != *prev_state {
                result.close_pause(tick);
                result.open_pause(event.state, tick);
                if event.state == ConnectionState::Reconnecting {
                    result.reconnection_count += 1;
                }
                info!(state = %event.state, tick, reason = ?event.reason, "sampling paused");
            }
            *paused = true;
        }
        ConnectionState::Connected => {
            if *paused {
                info!(tick, "sampling resumed");
            }
            result.close_pause(tick);
            *paused = false;
        }
        ConnectionState::Failed => {
            error!(tick, "connection failed; truncating scenario");
            return EventOutcome::Fatal;
        }
        ConnectionState::Disconnected => {
            info!(tick, "connection closed; truncating scenario");
            return EventOutcome::Stopped;
        }
        ConnectionState::Connecting => {}
    }
    *prev_state = event.state;
    EventOutcome::Continue
}

/// Resolves once the stop flag is set; pends forever when the sender is
/// dropped without setting it
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ScenarioName;
    use ecu_connection::ConnectionConfig;
    use obd_transport::mock::MockTransport;
    use obd_transport::{standard_registry, PidMode};
    use std::sync::Arc;

    #[derive(Default)]
    struct CollectSink {
        results: Vec<ScenarioResult>,
        metadata: Option<SessionMetadata>,
    }

    #[async_trait]
    impl ScenarioSink for CollectSink {
        async fn record_scenario(&mut self, result: &ScenarioResult) -> Result<(), SinkError> {
            self.results.push(result.clone());
            Ok(())
        }

        async fn record_metadata(&mut self, metadata: &SessionMetadata) -> Result<(), SinkError> {
            self.metadata = Some(metadata.clone());
            Ok(())
        }
    }

    struct ChannelGate {
        rx: tokio::sync::mpsc::Receiver<()>,
    }

    #[async_trait]
    impl OperatorGate for ChannelGate {
        async fn wait_ready(&mut self, _spec: &ScenarioSpec) {
            let _ = self.rx.recv().await;
        }
    }

    fn rpm_set() -> PidSet {
        let registry = standard_registry();
        [registry.get("010C").unwrap().clone()]
            .into_iter()
            .collect()
    }

    fn unattended(duration_s: u64) -> Vec<ScenarioSpec> {
        let mut spec = ScenarioSpec::new(ScenarioName::Idle, Duration::from_secs(duration_s));
        spec.requires_operator_prompt = false;
        vec![spec]
    }

    async fn connected_manager(transport: &MockTransport) -> Arc<ConnectionManager> {
        transport.respond(PidMode::Standard01, 0x0C, vec![0x1A, 0xF0]);
        let manager = Arc::new(ConnectionManager::new(
            Box::new(transport.clone()),
            ConnectionConfig::default(),
        ));
        manager.connect().await.unwrap();
        manager
    }

    fn stop_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_count_matches_duration_and_rate() {
        let transport = MockTransport::new();
        let manager = connected_manager(&transport).await;
        let (_stop_tx, stop_rx) = stop_pair();

        let scheduler = ScenarioScheduler::new(CaptureOptions::default());
        let mut sink = CollectSink::default();
        let metadata = scheduler
            .run_session(
                &manager,
                &rpm_set(),
                &unattended(10),
                &mut AutoGate,
                &mut sink,
                stop_rx,
            )
            .await;

        assert!(!metadata.terminated_early);
        assert_eq!(metadata.stats.total_samples, 10);
        assert_eq!(metadata.stats.failed_samples, 0);
        assert_eq!(metadata.scenarios.len(), 1);
        assert!(metadata.scenarios[0].completed);

        let result = &sink.results[0];
        assert_eq!(result.batches.len(), 10);
        assert!(result.batches.iter().all(|b| b.kind == TickKind::Sampled));
        assert_eq!(result.batches[0].readings[0].pid_id, "010C");
        assert_eq!(result.batches[0].readings[0].value, Some(1724.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_readings_keep_their_slots() {
        let transport = MockTransport::new();
        let manager = connected_manager(&transport).await;
        let (_stop_tx, stop_rx) = stop_pair();

        // RPM answers, coolant temperature never does
        let registry = standard_registry();
        let pids: PidSet = [
            registry.get("010C").unwrap().clone(),
            registry.get("0105").unwrap().clone(),
        ]
        .into_iter()
        .collect();

        let scheduler = ScenarioScheduler::new(CaptureOptions::default());
        let mut sink = CollectSink::default();
        let metadata = scheduler
            .run_session(
                &manager,
                &pids,
                &unattended(5),
                &mut AutoGate,
                &mut sink,
                stop_rx,
            )
            .await;

        assert_eq!(metadata.stats.total_samples, 5);
        assert_eq!(metadata.stats.failed_samples, 5);

        let result = &sink.results[0];
        for batch in &result.batches {
            assert_eq!(batch.readings.len(), 2);
            assert!(batch.readings[0].valid);
            assert!(!batch.readings[1].valid);
            assert_eq!(batch.readings[1].value, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_scenario_keeps_completed_ticks() {
        let transport = MockTransport::new();
        let manager = connected_manager(&transport).await;
        let (stop_tx, stop_rx) = stop_pair();

        let scheduler = ScenarioScheduler::new(CaptureOptions::default());
        let pids = rpm_set();
        let handle = tokio::spawn(async move {
            let mut sink = CollectSink::default();
            let metadata = scheduler
                .run_session(
                    &manager,
                    &pids,
                    &unattended(60),
                    &mut AutoGate,
                    &mut sink,
                    stop_rx,
                )
                .await;
            (metadata, sink)
        });

        tokio::time::sleep(Duration::from_millis(5500)).await;
        stop_tx.send(true).unwrap();
        let (metadata, sink) = handle.await.unwrap();

        assert!(metadata.terminated_early);
        assert_eq!(metadata.scenarios.len(), 1);
        assert!(!metadata.scenarios[0].completed);

        // Ticks at 0..=5 landed before the stop; nothing duplicated
        let result = &sink.results[0];
        assert!(result.truncated);
        assert_eq!(result.batches.len(), 6);
        let ticks: Vec<u32> = result.batches.iter().map(|b| b.tick).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting_for_operator() {
        let transport = MockTransport::new();
        let manager = connected_manager(&transport).await;
        let (stop_tx, stop_rx) = stop_pair();
        let (_gate_tx, gate_rx) = tokio::sync::mpsc::channel(1);

        let scheduler = ScenarioScheduler::new(CaptureOptions::default());
        let pids = rpm_set();
        let plan = vec![ScenarioSpec::new(ScenarioName::Idle, Duration::from_secs(60))];
        let handle = tokio::spawn(async move {
            let mut gate = ChannelGate { rx: gate_rx };
            scheduler
                .run_session(&manager, &pids, &plan, &mut gate, &mut NullSink, stop_rx)
                .await
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        stop_tx.send(true).unwrap();
        let metadata = handle.await.unwrap();

        assert!(metadata.terminated_early);
        assert!(metadata.scenarios.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_across_reconnect() {
        let transport = MockTransport::new();
        let manager = connected_manager(&transport).await;
        let (_stop_tx, stop_rx) = stop_pair();

        let maintainer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.maintain_connection().await })
        };

        let scheduler = ScenarioScheduler::new(CaptureOptions::default());
        let pids = rpm_set();
        let session_manager = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            let mut sink = CollectSink::default();
            let metadata = scheduler
                .run_session(
                    &session_manager,
                    &pids,
                    &unattended(60),
                    &mut AutoGate,
                    &mut sink,
                    stop_rx,
                )
                .await;
            (metadata, sink)
        });

        // Drop the link mid-scenario: the next sampled query degrades the
        // connection, the health checker escalates, and reconnection
        // attempts fail until the link comes back
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        transport.set_link(false);
        tokio::time::sleep(Duration::from_millis(26_500)).await;
        transport.set_link(true);

        let (metadata, sink) = handle.await.unwrap();
        assert!(!metadata.terminated_early);
        assert_eq!(metadata.stats.reconnections, 1);

        let result = &sink.results[0];
        assert!(!result.truncated);
        assert_eq!(result.batches.len(), 60);
        assert_eq!(result.reconnection_count, 1);
        assert!(result.skipped_ticks() > 0);
        assert!(result.sampled_ticks() >= 30);

        // One degraded interval, then one reconnecting interval, both closed
        // when the link recovered
        assert_eq!(result.pauses.len(), 2);
        assert_eq!(result.pauses[0].state, ConnectionState::Degraded);
        assert_eq!(result.pauses[1].state, ConnectionState::Reconnecting);
        assert!(result.pauses.iter().all(|p| p.to_tick.is_some()));
        assert!(result.pauses[0].from_tick <= result.pauses[1].from_tick);

        let stats = manager.stats().await;
        assert_eq!(stats.reconnections, 1);
        assert_eq!(stats.reconnect_attempts, 0);
        assert_eq!(stats.backoff_delays, 2);

        manager.disconnect().await;
        maintainer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_truncates_session() {
        let transport = MockTransport::new();
        transport.respond(PidMode::Standard01, 0x0C, vec![0x1A, 0xF0]);
        let (_stop_tx, stop_rx) = stop_pair();

        let config = ConnectionConfig {
            reconnect_attempts: 2,
            ..ConnectionConfig::default()
        };
        let manager = Arc::new(ConnectionManager::new(Box::new(transport.clone()), config));
        manager.connect().await.unwrap();

        let maintainer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.maintain_connection().await })
        };

        let scheduler = ScenarioScheduler::new(CaptureOptions::default());
        let pids = rpm_set();
        let mut plan = unattended(120);
        plan.extend(unattended(120));
        let session_manager = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            let mut sink = CollectSink::default();
            let metadata = scheduler
                .run_session(
                    &session_manager,
                    &pids,
                    &plan,
                    &mut AutoGate,
                    &mut sink,
                    stop_rx,
                )
                .await;
            (metadata, sink)
        });

        // Link never comes back; reconnection exhausts its two attempts
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        transport.set_link(false);

        let (metadata, sink) = handle.await.unwrap();
        assert!(metadata.terminated_early);
        assert_eq!(metadata.scenarios.len(), 1);
        assert!(!metadata.scenarios[0].completed);
        assert_eq!(manager.state(), ConnectionState::Failed);

        // The truncated scenario still carries everything captured so far
        let result = &sink.results[0];
        assert!(result.truncated);
        assert!(result.sampled_ticks() >= 10);

        maintainer.await.unwrap();
    }
}
