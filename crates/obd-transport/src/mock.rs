//! Scriptable In-Memory Transport
//!
//! Stands in for real adapter hardware in tests and bench-top runs. The
//! script is shared behind an `Arc`, so a test can keep a clone of the
//! transport and inject link loss or query failures while components run.

use crate::command::{ObdCommand, PidMode};
use crate::error::TransportError;
use crate::transport::{PortSettings, ProtocolInfo, RawResponse, Transport, TransportHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MockScript {
    link_up: bool,
    fail_opens: u32,
    fail_queries: u32,
    responses: HashMap<(u8, u8), Vec<u8>>,
    opens: u32,
    queries: u32,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            link_up: true,
            fail_opens: 0,
            fail_queries: 0,
            responses: HashMap::new(),
            opens: 0,
            queries: 0,
        }
    }
}

/// Simulated adapter with scriptable failures
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<MockScript>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload for one parameter; unregistered parameters answer
    /// NO DATA
    pub fn respond(&self, mode: PidMode, pid: u8, payload: Vec<u8>) {
        let mut script = self.script.lock().unwrap();
        script.responses.insert((mode.as_byte(), pid), payload);
    }

    /// Fail the next `n` queries with a timeout
    pub fn fail_next_queries(&self, n: u32) {
        self.script.lock().unwrap().fail_queries = n;
    }

    /// Fail the next `n` open calls
    pub fn fail_next_opens(&self, n: u32) {
        self.script.lock().unwrap().fail_opens = n;
    }

    /// Drop or restore the physical link; while down, opens and queries fail
    pub fn set_link(&self, up: bool) {
        self.script.lock().unwrap().link_up = up;
    }

    pub fn open_count(&self) -> u32 {
        self.script.lock().unwrap().opens
    }

    pub fn query_count(&self) -> u32 {
        self.script.lock().unwrap().queries
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        settings: &PortSettings,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let info = {
            let mut script = self.script.lock().unwrap();
            if script.fail_opens > 0 {
                script.fail_opens -= 1;
                return Err(TransportError::Open {
                    port: settings.port.clone(),
                    reason: "scripted open failure".to_string(),
                });
            }
            if !script.link_up {
                return Err(TransportError::Open {
                    port: settings.port.clone(),
                    reason: "link down".to_string(),
                });
            }
            script.opens += 1;
            ProtocolInfo {
                name: "ISO 15765-4 (CAN 11/500)".to_string(),
                id: "6".to_string(),
                port: settings.port.clone(),
                ecu_count: 1,
            }
        };

        Ok(Box::new(MockHandle {
            script: Arc::clone(&self.script),
            info,
            alive: true,
        }))
    }
}

struct MockHandle {
    script: Arc<Mutex<MockScript>>,
    info: ProtocolInfo,
    alive: bool,
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn query(
        &mut self,
        command: ObdCommand,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        if !self.alive {
            return Err(TransportError::Closed);
        }

        let mut script = self.script.lock().unwrap();
        script.queries += 1;

        if !script.link_up {
            return Err(TransportError::Io("link lost".to_string()));
        }
        if script.fail_queries > 0 {
            script.fail_queries -= 1;
            return Err(TransportError::Timeout(timeout.as_millis() as u64));
        }
        match script.responses.get(&(command.mode().as_byte(), command.pid())) {
            Some(payload) => Ok(RawResponse {
                payload: payload.clone(),
                text: payload
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<String>(),
            }),
            None => Ok(RawResponse {
                payload: Vec::new(),
                text: "NO DATA".to_string(),
            }),
        }
    }

    async fn close(&mut self) {
        self.alive = false;
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn protocol_info(&self) -> ProtocolInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses() {
        let transport = MockTransport::new();
        transport.respond(PidMode::Standard01, 0x0C, vec![0x1A, 0xF0]);

        let mut handle = transport.open(&PortSettings::default()).await.unwrap();
        let reply = handle
            .query(ObdCommand::read(PidMode::Standard01, 0x0C), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, vec![0x1A, 0xF0]);

        let reply = handle
            .query(ObdCommand::read(PidMode::Standard01, 0x0D), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!reply.has_payload());
        assert_eq!(transport.query_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let transport = MockTransport::new();
        transport.fail_next_opens(1);
        assert!(transport.open(&PortSettings::default()).await.is_err());

        let mut handle = transport.open(&PortSettings::default()).await.unwrap();
        transport.fail_next_queries(1);
        let cmd = ObdCommand::read(PidMode::Standard01, 0x0C);
        assert!(handle.query(cmd, Duration::from_secs(1)).await.is_err());
        assert!(handle.query(cmd, Duration::from_secs(1)).await.is_ok());

        transport.set_link(false);
        assert!(handle.query(cmd, Duration::from_secs(1)).await.is_err());
        assert!(transport.open(&PortSettings::default()).await.is_err());
    }
}
