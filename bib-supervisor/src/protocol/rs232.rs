//! RS-232 protocol handler over the system serial port.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio_util::sync::CancellationToken;

use crate::config::bib::{Handshake, ParityMode, PortConfig};
use crate::pool::new_token;
use crate::protocol::{
    ProtocolError, ProtocolFactory, ProtocolHandler, ProtocolRequest, ProtocolResponse,
    SessionHandle, SessionState,
};

/// How often the read loop polls for new bytes and checks cancellation.
const READ_POLL: Duration = Duration::from_millis(50);

/// Factory for [`Rs232Handler`].
#[derive(Debug, Default)]
pub struct Rs232Factory;

impl ProtocolFactory for Rs232Factory {
    fn name(&self) -> &str {
        "rs232"
    }

    fn create(&self) -> Box<dyn ProtocolHandler> {
        Box::new(Rs232Handler::new())
    }
}

/// Blocking RS-232 session over one serial port.
#[derive(Default)]
pub struct Rs232Handler {
    state: SessionState,
    session: Option<SessionHandle>,
    port: Option<Box<dyn SerialPort>>,
}

impl Rs232Handler {
    /// Creates a closed handler.
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(port_name: &str, config: &PortConfig) -> Result<Box<dyn SerialPort>, ProtocolError> {
        let data_bits = match config.data_pattern.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match config.data_pattern.parity {
            ParityMode::None => Parity::None,
            ParityMode::Even => Parity::Even,
            ParityMode::Odd => Parity::Odd,
        };
        let stop_bits = match config.data_pattern.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let flow_control = match config.handshake {
            Handshake::None => FlowControl::None,
            Handshake::Software => FlowControl::Software,
            Handshake::Hardware => FlowControl::Hardware,
        };

        let mut port = serialport::new(port_name, config.speed)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(READ_POLL.min(config.read_timeout))
            .open()
            .map_err(|e| ProtocolError::ProtocolIoError(std::io::Error::other(e)))?;

        port.write_data_terminal_ready(config.dtr_enable)
            .map_err(|e| ProtocolError::ProtocolIoError(std::io::Error::other(e)))?;
        port.write_request_to_send(config.rts_enable)
            .map_err(|e| ProtocolError::ProtocolIoError(std::io::Error::other(e)))?;
        Ok(port)
    }

    /// One write + read attempt against the open port.
    fn attempt(
        port: &mut Box<dyn SerialPort>,
        request: &ProtocolRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ProtocolError> {
        port.write_all(&request.command)
            .and_then(|_| port.flush())
            .map_err(ProtocolError::ProtocolIoError)?;

        let deadline = Instant::now() + request.timeout;
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            if cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }

            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(read) => {
                    buffer.extend_from_slice(&chunk[..read]);

                    // (a) the expected pattern is already satisfied
                    if let Some(expected) = &request.expected {
                        let text = String::from_utf8_lossy(&buffer);
                        if expected.is_match(text.trim_end_matches(['\r', '\n'])) {
                            return Ok(buffer);
                        }
                    }
                    // (b) line terminator
                    if buffer.ends_with(b"\n") {
                        return Ok(buffer);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ProtocolError::ProtocolIoError(e)),
            }

            // (c) timeout
            if Instant::now() >= deadline {
                if buffer.is_empty() {
                    return Err(ProtocolError::ProtocolTimeout);
                }
                // Partial data is handed to validation rather than dropped.
                return Ok(buffer);
            }
        }
    }
}

impl ProtocolHandler for Rs232Handler {
    #[tracing::instrument(skip_all, fields(port = %port_name))]
    fn open(
        &mut self,
        port_name: &str,
        config: &PortConfig,
    ) -> Result<SessionHandle, ProtocolError> {
        if self.state == SessionState::Open {
            self.close()?;
        }
        self.state = SessionState::Opening;

        match Self::configure(port_name, config) {
            Ok(port) => {
                let session = SessionHandle {
                    session_id: new_token(),
                    port_name: port_name.to_owned(),
                    opened_at: std::time::SystemTime::now(),
                };
                tracing::debug!(session = %session.session_id, "session open");
                self.port = Some(port);
                self.session = Some(session.clone());
                self.state = SessionState::Open;
                Ok(session)
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    fn send(
        &mut self,
        request: &ProtocolRequest,
        cancel: &CancellationToken,
    ) -> Result<ProtocolResponse, ProtocolError> {
        if self.state != SessionState::Open {
            return Err(ProtocolError::SessionNotOpen);
        }
        let port = self.port.as_mut().ok_or(ProtocolError::SessionNotOpen)?;

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match Self::attempt(port, request, cancel) {
                Ok(bytes) => {
                    return Ok(ProtocolResponse::from_bytes(
                        bytes,
                        started.elapsed(),
                        attempts,
                    ))
                }
                // I/O errors are retried; timeouts and cancellation are not.
                Err(ProtocolError::ProtocolIoError(e)) if attempts <= request.retry_count => {
                    tracing::warn!(attempt = attempts, "I/O error, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        if self.state == SessionState::Closed && self.port.is_none() {
            return Ok(());
        }
        self.state = SessionState::Closing;
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush() {
                tracing::debug!("flush on close failed: {e}");
            }
        }
        if let Some(session) = self.session.take() {
            tracing::debug!(session = %session.session_id, "session closed");
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }
}

impl Drop for Rs232Handler {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
