//! Serial protocol sessions.
//!
//! A [`ProtocolHandler`] owns one session with one port and walks the
//! state machine `Closed → Opening → Open → Closing → Closed`. Handlers are
//! created through a [`ProtocolFactory`] looked up by protocol name in the
//! [`ProtocolRegistry`]; RS-232 is the one built-in protocol, the registry
//! is the extension point for others.

pub mod fake;
pub mod rs232;

pub use fake::{FakeProtocolFactory, FakeScript};
pub use rs232::Rs232Factory;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::bib::{PortConfig, ProtocolCommand};
use crate::validation::ValidationLevel;

/// Errors surfaced by protocol handlers.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// No response arrived within the request timeout.
    #[error("timed out waiting for a response")]
    ProtocolTimeout,
    /// The underlying byte stream failed.
    #[error("serial I/O failed")]
    ProtocolIoError(#[source] std::io::Error),
    /// The session is not open.
    #[error("session is not open")]
    SessionNotOpen,
    /// The send was cancelled from outside.
    #[error("send cancelled")]
    Cancelled,
    /// No factory is registered under the requested protocol name.
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session.
    #[default]
    Closed,
    /// The port is being configured.
    Opening,
    /// The session is usable.
    Open,
    /// Pending output is being flushed.
    Closing,
}

/// An open session's identity.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Opaque session token, also recorded in the pool allocation audit.
    pub session_id: String,
    /// The port the session is bound to.
    pub port_name: String,
    /// When the session was opened.
    pub opened_at: SystemTime,
}

/// One request/response exchange.
#[derive(Debug, Clone)]
pub struct ProtocolRequest {
    /// Bytes written to the port.
    pub command: Vec<u8>,
    /// Overall response deadline.
    pub timeout: Duration,
    /// Resend attempts on I/O errors.
    pub retry_count: u32,
    /// Early-completion pattern: the read finishes as soon as the
    /// accumulated response matches.
    pub expected: Option<Regex>,
}

impl From<&ProtocolCommand> for ProtocolRequest {
    fn from(command: &ProtocolCommand) -> Self {
        let expected = command
            .rules
            .iter()
            .find(|r| r.level == ValidationLevel::Pass)
            .map(|r| r.regex.clone());
        Self {
            command: command.command.clone(),
            timeout: command.timeout,
            retry_count: command.retry_count,
            expected,
        }
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolResponse {
    /// Raw bytes as read from the port.
    pub bytes: Vec<u8>,
    /// Lossy UTF-8 rendering used for validation.
    pub text: String,
    /// Time from write to completion.
    pub elapsed: Duration,
    /// Number of attempts used (1 = no retries).
    pub attempts: u32,
}

impl ProtocolResponse {
    pub(crate) fn from_bytes(bytes: Vec<u8>, elapsed: Duration, attempts: u32) -> Self {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Self {
            bytes,
            text,
            elapsed,
            attempts,
        }
    }
}

/// A protocol session with one port.
///
/// Handlers do blocking I/O; callers in async context run them on the
/// blocking thread pool. The cancellation token is polled between reads, so
/// an in-flight send stops within one poll interval of cancellation.
pub trait ProtocolHandler: Send {
    /// Opens a session, configuring the port from `config`.
    fn open(&mut self, port_name: &str, config: &PortConfig)
        -> Result<SessionHandle, ProtocolError>;

    /// Writes the request and reads the response.
    fn send(
        &mut self,
        request: &ProtocolRequest,
        cancel: &CancellationToken,
    ) -> Result<ProtocolResponse, ProtocolError>;

    /// Flushes pending output and closes. Idempotent.
    fn close(&mut self) -> Result<(), ProtocolError>;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// The open session, if any.
    fn session(&self) -> Option<&SessionHandle>;
}

/// Creates protocol handlers for one protocol name.
pub trait ProtocolFactory: Send + Sync {
    /// Name the factory is registered under, e.g. `rs232`.
    fn name(&self) -> &str;

    /// Creates a fresh handler in the `Closed` state.
    fn create(&self) -> Box<dyn ProtocolHandler>;
}

/// Open-set registry of protocol factories, keyed by protocol name.
pub struct ProtocolRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ProtocolFactory>>>,
}

impl ProtocolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in RS-232 factory.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(Rs232Factory));
        registry
    }

    /// Registers a factory under its name, replacing any previous one.
    pub fn register(&self, factory: Arc<dyn ProtocolFactory>) {
        let name = factory.name().to_lowercase();
        tracing::debug!(protocol = %name, "protocol factory registered");
        self.factories.write().unwrap().insert(name, factory);
    }

    /// Creates a handler for a protocol name.
    pub fn create(&self, name: &str) -> Result<Box<dyn ProtocolHandler>, ProtocolError> {
        self.factories
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .map(|f| f.create())
            .ok_or_else(|| ProtocolError::UnknownProtocol(name.to_owned()))
    }

    /// Registered protocol names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn registry_resolves_case_insensitively() {
        let registry = ProtocolRegistry::with_defaults();
        assert!(registry.create("rs232").is_ok());
        assert!(registry.create("RS232").is_ok());
        assert!(matches!(
            registry.create("modbus"),
            Err(ProtocolError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn registry_is_an_open_set() {
        let registry = ProtocolRegistry::with_defaults();
        let (factory, _script) = FakeProtocolFactory::named("loopback");
        registry.register(Arc::new(factory));
        assert_eq!(registry.names(), vec!["loopback".to_owned(), "rs232".to_owned()]);
        assert!(registry.create("loopback").is_ok());
    }

    #[test]
    fn request_takes_pass_rule_as_expected_pattern() {
        use crate::validation::LevelRule;
        let command = ProtocolCommand {
            command: b"RUN\r\n".to_vec(),
            rules: vec![
                LevelRule::new(ValidationLevel::Fail, "^FAIL$", true, false).unwrap(),
                LevelRule::new(ValidationLevel::Pass, "^PASS$", true, false).unwrap(),
            ],
            timeout: Duration::from_millis(500),
            retry_count: 1,
            continue_on_failure: false,
        };
        let request = ProtocolRequest::from(&command);
        assert_eq!(request.expected.unwrap().as_str(), "^PASS$");
        assert_eq!(request.retry_count, 1);
    }
}
