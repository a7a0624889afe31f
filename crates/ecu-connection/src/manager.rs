//! Connection Manager Implementation
//!
//! Single owner of the transport handle. All queries from upstream
//! components are serialized through this type, which keeps the half-duplex
//! serial link safe, and all state transitions happen here and nowhere else.

use crate::backoff::backoff_delay;
use crate::config::ConnectionConfig;
use crate::error::{ConnectError, QueryError};
use crate::state::{ConnectionEvent, ConnectionState, EventReason};
use chrono::{DateTime, Utc};
use obd_transport::{
    ObdCommand, PidDescriptor, PidMode, ProtocolInfo, RawResponse, Transport, TransportHandle,
};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Handshake / health-check command: engine RPM, cheap and answered by any
/// running ECU
const PROBE_COMMAND: ObdCommand = ObdCommand::read(PidMode::Standard01, 0x0C);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Details recorded when a connection is established
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub protocol: ProtocolInfo,
    pub connected_at: DateTime<Utc>,
}

/// One decoded query result
#[derive(Debug, Clone)]
pub struct PidValue {
    pub pid_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Counters exposed for session statistics and tests
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConnectionStats {
    /// Successful mid-session recoveries
    pub reconnections: u32,
    /// Current attempt counter; reset to zero on recovery
    pub reconnect_attempts: u32,
    /// Backoff delays actually taken
    pub backoff_delays: u32,
    /// Health checks that failed over the life of the manager
    pub health_check_failures: u32,
}

struct Inner {
    handle: Option<Box<dyn TransportHandle>>,
    info: Option<ConnectionInfo>,
    health_failures: u32,
    stats: ConnectionStats,
}

/// Owns the transport and runs the connection lifecycle state machine
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(transport: Box<dyn Transport>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            transport,
            inner: Mutex::new(Inner {
                handle: None,
                info: None,
                health_failures: 0,
                stats: ConnectionStats::default(),
            }),
            state_tx,
            events,
        }
    }

    /// Current state snapshot; valid until the next event notification
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch channel mirroring the state, for components that want to wait
    /// on transitions without consuming the event stream
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to transition events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn info(&self) -> Option<ConnectionInfo> {
        self.inner.lock().await.info.clone()
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.inner.lock().await.stats
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Establish the connection. Idempotent while Connected: returns the
    /// existing info without touching the transport.
    pub async fn connect(&self) -> Result<ConnectionInfo, ConnectError> {
        let mut inner = self.inner.lock().await;

        if self.state() == ConnectionState::Connected {
            if let Some(info) = inner.info.clone() {
                debug!("connect() while already connected; returning existing info");
                return Ok(info);
            }
        }

        self.set_state(
            &mut inner,
            ConnectionState::Connecting,
            EventReason::ConnectRequested,
        );

        let mut last_error = String::new();
        for attempt in 1..=self.config.connect_attempts {
            info!(attempt, max = self.config.connect_attempts, "connecting to ECU");
            match self.open_and_verify(&mut inner).await {
                Ok(info) => {
                    self.set_state(
                        &mut inner,
                        ConnectionState::Connected,
                        EventReason::HandshakeComplete,
                    );
                    info!(
                        protocol = %info.protocol.name,
                        port = %info.protocol.port,
                        "connected to ECU"
                    );
                    return Ok(info);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "connect attempt failed");
                    last_error = e;
                    if attempt < self.config.connect_attempts {
                        tokio::time::sleep(self.config.reconnect_base_delay).await;
                    }
                }
            }
        }

        self.set_state(
            &mut inner,
            ConnectionState::Failed,
            EventReason::StartupExhausted,
        );
        error!("all startup connect attempts failed");
        Err(ConnectError::OpenExhausted {
            port: self.config.port.clone(),
            attempts: self.config.connect_attempts,
            last_error,
        })
    }

    /// Query one parameter and decode it. Only legal while Connected or
    /// Degraded; a success while Degraded is the recovery signal.
    pub async fn query(&self, pid: &PidDescriptor) -> Result<PidValue, QueryError> {
        let mut inner = self.inner.lock().await;
        let state = self.state();
        if !state.can_query() {
            return Err(QueryError::NotConnected(state));
        }

        let handle = inner
            .handle
            .as_mut()
            .ok_or(QueryError::NotConnected(state))?;

        match handle.query(pid.command(), self.config.query_timeout).await {
            Ok(raw) => {
                self.note_query_success(&mut inner);
                if !raw.has_payload() {
                    return Err(QueryError::Decode {
                        pid: pid.id.clone(),
                        reason: format!("no data ({})", raw.text),
                    });
                }
                match pid.decode_in_domain(&raw.payload) {
                    Some(value) => Ok(PidValue {
                        pid_id: pid.id.clone(),
                        timestamp: Utc::now(),
                        value,
                    }),
                    None => Err(QueryError::Decode {
                        pid: pid.id.clone(),
                        reason: format!("payload {:02X?} outside expected domain", raw.payload),
                    }),
                }
            }
            Err(e) => {
                self.note_query_failure(&mut inner);
                Err(QueryError::Transport(e))
            }
        }
    }

    /// Query without decoding; used for manufacturer-specific scans where no
    /// decode table exists. Same state rules and failure handling as `query`.
    pub async fn query_raw(&self, mode: PidMode, pid: u8) -> Result<RawResponse, QueryError> {
        let mut inner = self.inner.lock().await;
        let state = self.state();
        if !state.can_query() {
            return Err(QueryError::NotConnected(state));
        }

        let handle = inner
            .handle
            .as_mut()
            .ok_or(QueryError::NotConnected(state))?;

        match handle
            .query(ObdCommand::read(mode, pid), self.config.query_timeout)
            .await
        {
            Ok(raw) => {
                self.note_query_success(&mut inner);
                Ok(raw)
            }
            Err(e) => {
                self.note_query_failure(&mut inner);
                Err(QueryError::Transport(e))
            }
        }
    }

    /// Health-check/reconnect loop. Runs until an explicit disconnect or
    /// until reconnection is exhausted; the only owner of wall-clock-driven
    /// transitions.
    pub async fn maintain_connection(&self) {
        info!(
            interval_s = self.config.health_check_interval.as_secs(),
            "starting connection maintenance loop"
        );
        let mut state_rx = self.state_tx.subscribe();

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Disconnected | ConnectionState::Failed => break,
                ConnectionState::Reconnecting => {
                    self.run_reconnect().await;
                }
                ConnectionState::Connecting => {
                    // connect() is in flight on another task
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
                ConnectionState::Connected | ConnectionState::Degraded => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.health_check_interval) => {
                            self.health_check().await;
                        }
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("connection maintenance loop stopped");
    }

    /// Always transitions to Disconnected and releases the transport; never
    /// fails.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut handle) = inner.handle.take() {
            handle.close().await;
        }
        inner.health_failures = 0;
        inner.stats.reconnect_attempts = 0;
        if self.state() != ConnectionState::Disconnected {
            self.set_state(
                &mut inner,
                ConnectionState::Disconnected,
                EventReason::DisconnectRequested,
            );
            info!("disconnected from ECU");
        }
    }

    // -- internals ----------------------------------------------------------

    /// Open the port and verify the link with one probe query. A handle that
    /// opens but cannot answer is not a connection.
    async fn open_and_verify(&self, inner: &mut Inner) -> Result<ConnectionInfo, String> {
        if let Some(mut stale) = inner.handle.take() {
            stale.close().await;
        }

        let mut handle = self
            .transport
            .open(&self.config.port_settings())
            .await
            .map_err(|e| e.to_string())?;

        handle
            .query(PROBE_COMMAND, self.config.query_timeout)
            .await
            .map_err(|e| format!("verify query failed: {e}"))?;

        let info = ConnectionInfo {
            protocol: handle.protocol_info(),
            connected_at: Utc::now(),
        };
        inner.handle = Some(handle);
        inner.info = Some(info.clone());
        inner.health_failures = 0;
        Ok(info)
    }

    async fn health_check(&self) {
        let mut inner = self.inner.lock().await;
        let state = self.state();
        if !state.can_query() {
            return;
        }
        let Some(handle) = inner.handle.as_mut() else {
            return;
        };

        match handle.query(PROBE_COMMAND, self.config.query_timeout).await {
            Ok(_) => {
                if state == ConnectionState::Degraded {
                    info!("health check recovered; link back to connected");
                    inner.health_failures = 0;
                    self.set_state(
                        &mut inner,
                        ConnectionState::Connected,
                        EventReason::HealthCheckRecovered,
                    );
                }
            }
            Err(e) => {
                inner.health_failures += 1;
                inner.stats.health_check_failures += 1;
                let consecutive = inner.health_failures;
                warn!(consecutive, error = %e, "health check failed");

                if consecutive >= self.config.degraded_threshold {
                    self.set_state(
                        &mut inner,
                        ConnectionState::Reconnecting,
                        EventReason::HealthCheckFailed { consecutive },
                    );
                } else {
                    self.set_state(
                        &mut inner,
                        ConnectionState::Degraded,
                        EventReason::HealthCheckFailed { consecutive },
                    );
                }
            }
        }
    }

    /// On success while Degraded the link is considered recovered.
    fn note_query_success(&self, inner: &mut Inner) {
        if self.state() == ConnectionState::Degraded {
            inner.health_failures = 0;
            self.set_state(
                inner,
                ConnectionState::Connected,
                EventReason::QueryRecovered,
            );
        }
    }

    /// A failed caller query degrades a healthy link and escalates an
    /// already-degraded one.
    fn note_query_failure(&self, inner: &mut Inner) {
        match self.state() {
            ConnectionState::Connected => {
                self.set_state(inner, ConnectionState::Degraded, EventReason::QueryFailed);
            }
            ConnectionState::Degraded => {
                self.set_state(
                    inner,
                    ConnectionState::Reconnecting,
                    EventReason::QueryFailed,
                );
            }
            _ => {}
        }
    }

    /// Reconnection with exponential backoff. The delay is taken after a
    /// failed attempt, before the next one.
    async fn run_reconnect(&self) {
        let max_attempts = self.config.reconnect_attempts;

        for attempt in 1..=max_attempts {
            if self.state() != ConnectionState::Reconnecting {
                // disconnect() raced us; nothing to recover
                return;
            }

            {
                let mut inner = self.inner.lock().await;
                inner.stats.reconnect_attempts = attempt;
                self.emit(
                    ConnectionState::Reconnecting,
                    EventReason::ReconnectAttempt { attempt },
                );
                info!(attempt, max_attempts, "reconnection attempt");

                match self.open_and_verify(&mut inner).await {
                    Ok(_) => {
                        inner.stats.reconnections += 1;
                        inner.stats.reconnect_attempts = 0;
                        self.set_state(
                            &mut inner,
                            ConnectionState::Connected,
                            EventReason::Reconnected { attempts: attempt },
                        );
                        info!(attempt, "reconnected to ECU");
                        return;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "reconnection attempt failed");
                    }
                }
            }

            if attempt < max_attempts {
                let delay = backoff_delay(
                    self.config.reconnect_base_delay,
                    self.config.reconnect_max_delay,
                    attempt,
                );
                {
                    let mut inner = self.inner.lock().await;
                    inner.stats.backoff_delays += 1;
                }
                debug!(delay_s = delay.as_secs_f64(), "backoff before next attempt");
                tokio::time::sleep(delay).await;
            }
        }

        let mut inner = self.inner.lock().await;
        if self.state() == ConnectionState::Reconnecting {
            error!(max_attempts, "reconnection exhausted; manual intervention required");
            self.set_state(
                &mut inner,
                ConnectionState::Failed,
                EventReason::ReconnectExhausted,
            );
        }
    }

    fn set_state(&self, _inner: &mut Inner, state: ConnectionState, reason: EventReason) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            debug!(from = %previous, to = %state, ?reason, "connection state transition");
        }
        self.state_tx.send_replace(state);
        self.emit(state, reason);
    }

    fn emit(&self, state: ConnectionState, reason: EventReason) {
        let _ = self.events.send(ConnectionEvent {
            state,
            timestamp: Utc::now(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_transport::mock::MockTransport;
    use obd_transport::standard_registry;
    use std::sync::Arc;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_attempts: 2,
            ..ConnectionConfig::default()
        }
    }

    fn rpm_responder() -> MockTransport {
        let transport = MockTransport::new();
        transport.respond(PidMode::Standard01, 0x0C, vec![0x1A, 0xF0]);
        transport
    }

    fn manager_with(transport: &MockTransport, config: ConnectionConfig) -> ConnectionManager {
        ConnectionManager::new(Box::new(transport.clone()), config)
    }

    /// Wait for a transition event with the given state. The event channel
    /// queues every transition, so short-lived states are not missed.
    async fn wait_for_state(
        rx: &mut broadcast::Receiver<ConnectionEvent>,
        wanted: ConnectionState,
    ) {
        loop {
            match rx.recv().await {
                Ok(event) if event.state == wanted => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_rejected_unless_connected() {
        let transport = rpm_responder();
        let manager = manager_with(&transport, test_config());
        let rpm = standard_registry().get("010C").unwrap().clone();

        // Disconnected
        assert!(matches!(
            manager.query(&rpm).await,
            Err(QueryError::NotConnected(ConnectionState::Disconnected))
        ));

        // Failed after startup exhaustion
        transport.fail_next_opens(10);
        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(matches!(
            manager.query(&rpm).await,
            Err(QueryError::NotConnected(ConnectionState::Failed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let transport = rpm_responder();
        let manager = manager_with(&transport, test_config());

        let first = manager.connect().await.unwrap();
        let again = manager.connect().await.unwrap();
        assert_eq!(first.connected_at, again.connected_at);
        // No second transport open happened
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_success_and_decode() {
        let transport = rpm_responder();
        let manager = manager_with(&transport, test_config());
        manager.connect().await.unwrap();

        let rpm = standard_registry().get("010C").unwrap().clone();
        let value = manager.query(&rpm).await.unwrap();
        // 0x1AF0 / 4 = 1724.0
        assert_eq!(value.value, 1724.0);
        assert_eq!(value.pid_id, "010C");
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_keeps_state() {
        let transport = rpm_responder();
        let manager = manager_with(&transport, test_config());
        manager.connect().await.unwrap();

        // SPEED is not scripted, so the mock answers NO DATA
        let speed = standard_registry().get("010D").unwrap().clone();
        assert!(matches!(
            manager.query(&speed).await,
            Err(QueryError::Decode { .. })
        ));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_failures_degrade_then_escalate() {
        let transport = rpm_responder();
        let manager = manager_with(&transport, test_config());
        manager.connect().await.unwrap();

        let rpm = standard_registry().get("010C").unwrap().clone();

        transport.fail_next_queries(1);
        assert!(manager.query(&rpm).await.is_err());
        assert_eq!(manager.state(), ConnectionState::Degraded);

        // Success while degraded is the recovery signal
        manager.query(&rpm).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);

        // Two consecutive failures escalate to reconnecting
        transport.fail_next_queries(2);
        assert!(manager.query(&rpm).await.is_err());
        assert!(manager.query(&rpm).await.is_err());
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_blip_recovers_without_reconnect() {
        let transport = rpm_responder();
        let manager = Arc::new(manager_with(&transport, test_config()));
        manager.connect().await.unwrap();

        let mut state_rx = manager.subscribe();
        let maintainer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.maintain_connection().await })
        };

        // One failed health check degrades the link
        transport.fail_next_queries(1);
        wait_for_state(&mut state_rx, ConnectionState::Degraded).await;

        // The next check succeeds: transient blip, no reconnection
        wait_for_state(&mut state_rx, ConnectionState::Connected).await;
        assert_eq!(transport.open_count(), 1);

        manager.disconnect().await;
        maintainer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_consecutive_health_failures() {
        let transport = rpm_responder();
        let manager = Arc::new(manager_with(&transport, test_config()));
        manager.connect().await.unwrap();

        let mut state_rx = manager.subscribe();
        let maintainer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.maintain_connection().await })
        };

        // Two consecutive health-check failures, then two failed reconnect
        // attempts before the third succeeds. Opens are scripted up front so
        // the first reconnect attempt cannot race the test task.
        transport.fail_next_queries(2);
        transport.fail_next_opens(2);
        wait_for_state(&mut state_rx, ConnectionState::Degraded).await;
        wait_for_state(&mut state_rx, ConnectionState::Reconnecting).await;
        wait_for_state(&mut state_rx, ConnectionState::Connected).await;

        let stats = manager.stats().await;
        assert_eq!(stats.reconnections, 1);
        assert_eq!(stats.reconnect_attempts, 0, "attempt counter resets on recovery");
        assert_eq!(stats.backoff_delays, 2, "one delay after each failed attempt");

        manager.disconnect().await;
        maintainer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_fails_link() {
        let config = ConnectionConfig {
            reconnect_attempts: 3,
            ..test_config()
        };
        let transport = rpm_responder();
        let manager = Arc::new(manager_with(&transport, config));
        manager.connect().await.unwrap();

        let mut state_rx = manager.subscribe();
        let maintainer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.maintain_connection().await })
        };

        // Link stays down for good
        transport.set_link(false);
        wait_for_state(&mut state_rx, ConnectionState::Failed).await;
        maintainer.await.unwrap();

        let rpm = standard_registry().get("010C").unwrap().clone();
        assert!(matches!(
            manager.query(&rpm).await,
            Err(QueryError::NotConnected(ConnectionState::Failed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_threshold_of_one_skips_degraded() {
        let config = ConnectionConfig {
            degraded_threshold: 1,
            ..test_config()
        };
        let transport = rpm_responder();
        let manager = Arc::new(manager_with(&transport, config));
        manager.connect().await.unwrap();

        let mut events = manager.subscribe();
        let mut state_rx = manager.subscribe();
        let maintainer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.maintain_connection().await })
        };

        transport.fail_next_queries(1);
        wait_for_state(&mut state_rx, ConnectionState::Reconnecting).await;
        wait_for_state(&mut state_rx, ConnectionState::Connected).await;

        // The first failure escalated straight to reconnecting
        let mut saw_degraded = false;
        while let Ok(event) = events.try_recv() {
            if event.state == ConnectionState::Degraded {
                saw_degraded = true;
            }
        }
        assert!(!saw_degraded);

        manager.disconnect().await;
        maintainer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_always_succeeds() {
        let transport = rpm_responder();
        let manager = manager_with(&transport, test_config());

        // Disconnect without ever connecting is a no-op
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect().await.unwrap();
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // And connecting again works
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }
}
