//! ELM327 Serial Transport
//!
//! Drives an ELM327-compatible adapter over a serial port (typically an
//! RFCOMM-bound Bluetooth device). The adapter answers every command with a
//! text block terminated by the '>' prompt.

use crate::command::ObdCommand;
use crate::error::TransportError;
use crate::transport::{PortSettings, ProtocolInfo, RawResponse, Transport, TransportHandle};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

const PROMPT: u8 = b'>';

/// Transport implementation for real ELM327 hardware
#[derive(Debug, Default)]
pub struct Elm327Transport;

impl Elm327Transport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for Elm327Transport {
    async fn open(
        &self,
        settings: &PortSettings,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        info!(port = %settings.port, baud = settings.baud_rate, "opening ELM327 adapter");

        let opened = timeout(settings.open_timeout, async {
            let port = tokio_serial::new(&settings.port, settings.baud_rate)
                .timeout(settings.query_timeout)
                .open_native_async()
                .map_err(|e| TransportError::Open {
                    port: settings.port.clone(),
                    reason: e.to_string(),
                })?;

            let mut handle = Elm327Handle {
                port,
                info: ProtocolInfo {
                    name: "unknown".to_string(),
                    id: "0".to_string(),
                    port: settings.port.clone(),
                    ecu_count: 1,
                },
                alive: true,
            };
            handle.initialize(settings.query_timeout).await?;
            Ok::<_, TransportError>(handle)
        })
        .await
        .map_err(|_| TransportError::Timeout(settings.open_timeout.as_millis() as u64))??;

        info!(protocol = %opened.info.name, "adapter initialized");
        Ok(Box::new(opened))
    }
}

struct Elm327Handle {
    port: SerialStream,
    info: ProtocolInfo,
    alive: bool,
}

impl Elm327Handle {
    /// Reset sequence: ATZ, echo/linefeed/spaces off, auto protocol
    async fn initialize(&mut self, timeout: Duration) -> Result<(), TransportError> {
        // ATZ resets the adapter; give it extra time to reboot.
        self.at_command("ATZ", timeout.max(Duration::from_secs(2))).await?;
        self.at_command("ATE0", timeout).await?;
        self.at_command("ATL0", timeout).await?;
        self.at_command("ATS0", timeout).await?;
        self.at_command("ATSP0", timeout).await?;

        // Protocol is only negotiated once the first request goes out; the
        // description commands still answer with the configured selection.
        self.info.name = self.at_command("ATDP", timeout).await?;
        self.info.id = self
            .at_command("ATDPN", timeout)
            .await?
            .trim_start_matches('A')
            .to_string();
        Ok(())
    }

    async fn at_command(&mut self, cmd: &str, deadline: Duration) -> Result<String, TransportError> {
        let raw = self.exchange(cmd, deadline).await?;
        Ok(raw.trim().to_string())
    }

    /// Write one command and read until the '>' prompt
    async fn exchange(&mut self, cmd: &str, deadline: Duration) -> Result<String, TransportError> {
        if !self.alive {
            return Err(TransportError::Closed);
        }
        debug!(command = cmd, "adapter write");

        let result = timeout(deadline, async {
            self.port.write_all(format!("{cmd}\r").as_bytes()).await?;
            self.port.flush().await?;

            let mut buf = Vec::with_capacity(128);
            let mut byte = [0u8; 1];
            loop {
                let n = self.port.read(&mut byte).await?;
                if n == 0 {
                    return Err(TransportError::Io("serial link closed".to_string()));
                }
                if byte[0] == PROMPT {
                    break;
                }
                buf.push(byte[0]);
            }
            Ok::<_, TransportError>(String::from_utf8_lossy(&buf).into_owned())
        })
        .await
        .map_err(|_| TransportError::Timeout(deadline.as_millis() as u64))?;

        let text = result?;
        // Echo suppression is requested at init but some clones send it anyway.
        let cleaned = text.replace(cmd, "");
        Ok(cleaned
            .trim_matches(|c: char| c == '\r' || c == '\n' || c == ' ')
            .to_string())
    }
}

#[async_trait]
impl TransportHandle for Elm327Handle {
    async fn query(
        &mut self,
        command: ObdCommand,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let text = self.exchange(&command.to_wire(), timeout).await?;
        Ok(parse_reply(command, &text))
    }

    async fn close(&mut self) {
        if self.alive {
            debug!("closing ELM327 handle");
            self.alive = false;
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn protocol_info(&self) -> ProtocolInfo {
        self.info.clone()
    }
}

/// Extract the payload bytes from an adapter reply.
///
/// A positive Mode-01 reply to "010C" looks like "410C1AF0" (spaces already
/// suppressed at init). Negative or empty replies keep their text but carry
/// no payload.
fn parse_reply(command: ObdCommand, text: &str) -> RawResponse {
    let line = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("SEARCHING"))
        .next_back()
        .unwrap_or("");

    if line.contains("NO DATA") || line.contains("UNABLE TO CONNECT") || line.contains("ERROR") {
        warn!(command = %command, reply = line, "negative adapter reply");
        return RawResponse {
            payload: Vec::new(),
            text: line.to_string(),
        };
    }

    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = match hex_bytes(&compact) {
        Some(b) => b,
        None => {
            return RawResponse {
                payload: Vec::new(),
                text: line.to_string(),
            }
        }
    };

    // Strip the mode/pid echo when present; some ECUs answer multi-frame
    // without it and we keep whatever is left.
    let payload = match bytes.as_slice() {
        [m, p, rest @ ..] if *m == command.mode().reply_byte() && *p == command.pid() => {
            rest.to_vec()
        }
        other => other.to_vec(),
    };

    RawResponse {
        payload,
        text: line.to_string(),
    }
}

/// Parse an even-length ASCII hex string. Anything else, including the
/// replacement characters that line noise turns into, yields `None`.
fn hex_bytes(s: &str) -> Option<Vec<u8>> {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() % 2 != 0 || !bytes.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    bytes
        .chunks(2)
        .map(|pair| {
            let digits = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(digits, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PidMode;

    #[test]
    fn test_parse_positive_reply() {
        let cmd = ObdCommand::read(PidMode::Standard01, 0x0C);
        let reply = parse_reply(cmd, "410C1AF0");
        assert_eq!(reply.payload, vec![0x1A, 0xF0]);
    }

    #[test]
    fn test_parse_reply_with_searching_banner() {
        let cmd = ObdCommand::read(PidMode::Standard01, 0x0D);
        let reply = parse_reply(cmd, "SEARCHING...\r\n410D55");
        assert_eq!(reply.payload, vec![0x55]);
    }

    #[test]
    fn test_parse_no_data() {
        let cmd = ObdCommand::read(PidMode::Standard01, 0x5E);
        let reply = parse_reply(cmd, "NO DATA");
        assert!(!reply.has_payload());
        assert_eq!(reply.text, "NO DATA");
    }

    #[test]
    fn test_parse_garbage_keeps_text() {
        let cmd = ObdCommand::read(PidMode::Manufacturer21, 0x01);
        let reply = parse_reply(cmd, "7F 21 11");
        // Spaces suppressed or not, a negative-response frame still parses as
        // bytes and is kept raw for the manufacturer scan.
        assert_eq!(reply.text, "7F 21 11");
    }

    #[test]
    fn test_parse_line_noise_yields_empty_payload() {
        // Serial noise during link instability arrives as replacement
        // characters after the lossy UTF-8 decode; the reply must come back
        // payload-less, never panic
        let cmd = ObdCommand::read(PidMode::Standard01, 0x0C);
        let reply = parse_reply(cmd, "A\u{FFFD}");
        assert!(!reply.has_payload());
        assert_eq!(reply.text, "A\u{FFFD}");

        let reply = parse_reply(cmd, "\u{FFFD}\u{FFFD}410C");
        assert!(!reply.has_payload());
    }

    #[test]
    fn test_hex_bytes() {
        assert_eq!(hex_bytes("410C"), Some(vec![0x41, 0x0C]));
        assert_eq!(hex_bytes("41G1"), None);
        assert_eq!(hex_bytes("41\u{FFFD}"), None);
        assert_eq!(hex_bytes("A\u{FFFD}"), None);
        assert_eq!(hex_bytes(""), None);
    }
}
