//! Scripted protocol handler for tests and hardware-less hosts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::bib::PortConfig;
use crate::pool::new_token;
use crate::protocol::{
    ProtocolError, ProtocolFactory, ProtocolHandler, ProtocolRequest, ProtocolResponse,
    SessionHandle, SessionState,
};

enum Scripted {
    Respond { bytes: Vec<u8>, delay: Duration },
    Timeout,
    IoError,
}

/// Shared script driving every handler a [`FakeProtocolFactory`] creates.
///
/// Responses are consumed in order across handlers; sent commands and
/// session open/close counts are recorded for assertions.
#[derive(Default)]
pub struct FakeScript {
    responses: Mutex<VecDeque<Scripted>>,
    sent: Mutex<Vec<Vec<u8>>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_open: AtomicUsize,
}

impl FakeScript {
    /// Queues a response; a trailing CRLF is appended when missing.
    pub fn push_response(&self, text: &str) {
        self.push_response_after(text, Duration::ZERO);
    }

    /// Queues a response that arrives after `delay` of bus time.
    pub fn push_response_after(&self, text: &str, delay: Duration) {
        let mut bytes = text.as_bytes().to_vec();
        if !bytes.ends_with(b"\n") {
            bytes.extend_from_slice(b"\r\n");
        }
        self.responses
            .lock()
            .unwrap()
            .push_back(Scripted::Respond { bytes, delay });
    }

    /// Queues a timeout.
    pub fn push_timeout(&self) {
        self.responses.lock().unwrap().push_back(Scripted::Timeout);
    }

    /// Queues an I/O error.
    pub fn push_io_error(&self) {
        self.responses.lock().unwrap().push_back(Scripted::IoError);
    }

    /// Makes the next `n` open attempts fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_open.store(n, Ordering::SeqCst);
    }

    /// Commands sent so far, in order.
    pub fn sent_commands(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// How many sessions were opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// How many sessions were closed.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory producing scripted handlers.
pub struct FakeProtocolFactory {
    name: String,
    script: Arc<FakeScript>,
}

impl FakeProtocolFactory {
    /// A fake registered under `rs232`, standing in for the real serial
    /// handler.
    pub fn new() -> (Self, Arc<FakeScript>) {
        Self::named("rs232")
    }

    /// A fake registered under an arbitrary protocol name.
    pub fn named(name: &str) -> (Self, Arc<FakeScript>) {
        let script = Arc::new(FakeScript::default());
        (
            Self {
                name: name.to_owned(),
                script: Arc::clone(&script),
            },
            script,
        )
    }
}

impl ProtocolFactory for FakeProtocolFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> Box<dyn ProtocolHandler> {
        Box::new(FakeProtocolHandler {
            script: Arc::clone(&self.script),
            state: SessionState::Closed,
            session: None,
        })
    }
}

struct FakeProtocolHandler {
    script: Arc<FakeScript>,
    state: SessionState,
    session: Option<SessionHandle>,
}

impl ProtocolHandler for FakeProtocolHandler {
    fn open(
        &mut self,
        port_name: &str,
        _config: &PortConfig,
    ) -> Result<SessionHandle, ProtocolError> {
        let failures = self.script.fail_open.load(Ordering::SeqCst);
        if failures > 0 {
            self.script.fail_open.store(failures - 1, Ordering::SeqCst);
            return Err(ProtocolError::ProtocolIoError(std::io::Error::other(
                "scripted open failure",
            )));
        }

        let session = SessionHandle {
            session_id: new_token(),
            port_name: port_name.to_owned(),
            opened_at: std::time::SystemTime::now(),
        };
        self.script.opened.fetch_add(1, Ordering::SeqCst);
        self.session = Some(session.clone());
        self.state = SessionState::Open;
        Ok(session)
    }

    fn send(
        &mut self,
        request: &ProtocolRequest,
        cancel: &CancellationToken,
    ) -> Result<ProtocolResponse, ProtocolError> {
        if self.state != SessionState::Open {
            return Err(ProtocolError::SessionNotOpen);
        }
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        self.script.sent.lock().unwrap().push(request.command.clone());

        let scripted = self.script.responses.lock().unwrap().pop_front();
        match scripted {
            Some(Scripted::Respond { bytes, delay }) => {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                    if cancel.is_cancelled() {
                        return Err(ProtocolError::Cancelled);
                    }
                }
                Ok(ProtocolResponse::from_bytes(bytes, delay.max(Duration::from_millis(1)), 1))
            }
            Some(Scripted::Timeout) | None => Err(ProtocolError::ProtocolTimeout),
            Some(Scripted::IoError) => Err(ProtocolError::ProtocolIoError(
                std::io::Error::other("scripted I/O error"),
            )),
        }
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        if self.state == SessionState::Open {
            self.script.closed.fetch_add(1, Ordering::SeqCst);
        }
        self.state = SessionState::Closed;
        self.session = None;
        Ok(())
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }
}
