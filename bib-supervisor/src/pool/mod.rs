//! Thread-safe port pool.
//!
//! The pool is the single shared mutable allocation structure of the
//! supervisor. Allocate/Release paths serialize on one exclusive lock;
//! enumeration happens outside the lock on a snapshot. Allocation records
//! are kept after release for auditing, and records whose port vanished
//! from a refresh are marked stale but preserved until released or the
//! pool is disposed.

pub mod reservation;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::discovery::enumerator::PortEnumerator;
use crate::discovery::validator::{validate, ValidationConfig};
use crate::discovery::PortInfo;
use crate::validation::ValidationLevel;

/// Generates an opaque random token for session and reservation ids.
pub(crate) fn new_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// One grant of a port to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    /// Allocated port name.
    pub port_name: String,
    /// Opaque session token; compared by plain equality.
    pub session_id: String,
    /// Client the port was granted to, if one was named.
    pub client_id: Option<String>,
    /// When the grant was made.
    pub allocated_at: SystemTime,
    /// When the grant was released, once it has been.
    pub released_at: Option<SystemTime>,
    /// Whether the grant is still held.
    pub is_active: bool,
    /// Set when the port vanished from an enumeration refresh while the
    /// grant was still held.
    pub is_stale: bool,
}

impl PortAllocation {
    fn duration(&self) -> Option<Duration> {
        self.released_at
            .and_then(|end| end.duration_since(self.allocated_at).ok())
    }
}

/// Aggregate counters over the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatistics {
    /// Ports seen by the last enumeration.
    pub total_ports: usize,
    /// Ports currently held by an active allocation.
    pub allocated_ports: usize,
    /// Ports seen and not held.
    pub available_ports: usize,
    /// Distinct clients holding at least one active allocation.
    pub active_clients: usize,
    /// Mean duration of released allocations, if any were released.
    pub average_allocation: Option<Duration>,
}

#[derive(Default)]
struct PoolState {
    active: HashMap<String, PortAllocation>,
    history: Vec<PortAllocation>,
    known_ports: Vec<String>,
    disposed: bool,
}

/// Grants at-most-one client per port.
pub struct PortPool {
    enumerator: Arc<dyn PortEnumerator>,
    state: Mutex<PoolState>,
}

impl PortPool {
    /// Creates a pool over the given enumerator.
    pub fn new(enumerator: Arc<dyn PortEnumerator>) -> Self {
        Self {
            enumerator,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Grants the first free port that satisfies the optional validator
    /// check, or `None` when no port qualifies or the pool is disposed.
    pub fn allocate(
        &self,
        config: Option<&ValidationConfig>,
        client_id: Option<&str>,
    ) -> Option<PortAllocation> {
        // Driver calls can block; never hold the pool lock across them.
        let snapshot = self.enumerator.enumerate();
        self.allocate_from(&snapshot, config, client_id, None)
    }

    /// Grants a specific port by name, subject to the same rules.
    pub fn allocate_named(
        &self,
        port_name: &str,
        config: Option<&ValidationConfig>,
        client_id: Option<&str>,
    ) -> Option<PortAllocation> {
        let snapshot = self.enumerator.enumerate();
        self.allocate_from(&snapshot, config, client_id, Some(port_name))
    }

    fn allocate_from(
        &self,
        snapshot: &[PortInfo],
        config: Option<&ValidationConfig>,
        client_id: Option<&str>,
        wanted: Option<&str>,
    ) -> Option<PortAllocation> {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return None;
        }
        state.known_ports = snapshot.iter().map(|p| p.port_name.clone()).collect();

        let candidate = snapshot.iter().find(|port| {
            if wanted.is_some_and(|w| w != port.port_name) {
                return false;
            }
            if state.active.contains_key(&port.port_name) {
                return false;
            }
            match config {
                Some(config) => validate(port, config).level == ValidationLevel::Pass,
                None => true,
            }
        })?;

        let allocation = PortAllocation {
            port_name: candidate.port_name.clone(),
            session_id: new_token(),
            client_id: client_id.map(str::to_owned),
            allocated_at: SystemTime::now(),
            released_at: None,
            is_active: true,
            is_stale: false,
        };
        tracing::info!(
            port = %allocation.port_name,
            client = allocation.client_id.as_deref().unwrap_or("-"),
            "port allocated"
        );
        state
            .active
            .insert(allocation.port_name.clone(), allocation.clone());
        Some(allocation)
    }

    /// Releases an active allocation.
    ///
    /// When `session_id` is given it must match the active allocation's
    /// token; a mismatch (or an already-released port) returns `false` and
    /// mutates nothing.
    pub fn release(&self, port_name: &str, session_id: Option<&str>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return false;
        }
        let Some(active) = state.active.get(port_name) else {
            return false;
        };
        if session_id.is_some_and(|s| s != active.session_id) {
            tracing::warn!(port = %port_name, "release refused: session id mismatch");
            return false;
        }

        let mut released = state.active.remove(port_name).unwrap();
        released.released_at = Some(SystemTime::now());
        released.is_active = false;
        tracing::info!(port = %port_name, "port released");
        state.history.push(released);
        true
    }

    /// Releases every active allocation held by `client_id`, returning how
    /// many were released.
    pub fn release_all_for_client(&self, client_id: &str) -> usize {
        let ports: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .active
                .values()
                .filter(|a| a.client_id.as_deref() == Some(client_id))
                .map(|a| a.port_name.clone())
                .collect()
        };
        ports
            .iter()
            .filter(|port| self.release(port, None))
            .count()
    }

    /// Snapshot of all active allocations.
    pub fn active_allocations(&self) -> Vec<PortAllocation> {
        self.state.lock().unwrap().active.values().cloned().collect()
    }

    /// Whether a port is held by an active allocation.
    pub fn is_allocated(&self, port_name: &str) -> bool {
        self.state.lock().unwrap().active.contains_key(port_name)
    }

    /// The active allocation of a port, or its most recent historical one.
    pub fn allocation(&self, port_name: &str) -> Option<PortAllocation> {
        let state = self.state.lock().unwrap();
        state.active.get(port_name).cloned().or_else(|| {
            state
                .history
                .iter()
                .rev()
                .find(|a| a.port_name == port_name)
                .cloned()
        })
    }

    /// Finds a port in a fresh enumeration snapshot.
    pub fn find_port(&self, port_name: &str) -> Option<PortInfo> {
        self.enumerator
            .enumerate()
            .into_iter()
            .find(|p| p.port_name == port_name)
    }

    /// Aggregate counters.
    pub fn statistics(&self) -> PoolStatistics {
        let state = self.state.lock().unwrap();
        let allocated = state.active.len();
        let total = state.known_ports.len();

        let clients: std::collections::HashSet<_> = state
            .active
            .values()
            .filter_map(|a| a.client_id.as_deref())
            .collect();

        let durations: Vec<Duration> =
            state.history.iter().filter_map(PortAllocation::duration).collect();
        let average_allocation = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<Duration>() / durations.len() as u32)
        };

        PoolStatistics {
            total_ports: total,
            allocated_ports: allocated,
            available_ports: total.saturating_sub(allocated),
            active_clients: clients.len(),
            average_allocation,
        }
    }

    /// Re-enumerates and returns the port count.
    ///
    /// Allocations whose port vanished are marked stale but preserved until
    /// released or disposal.
    pub fn refresh(&self) -> usize {
        let snapshot = self.enumerator.enumerate();
        let mut state = self.state.lock().unwrap();
        state.known_ports = snapshot.iter().map(|p| p.port_name.clone()).collect();
        for (port, allocation) in state.active.iter_mut() {
            let present = snapshot.iter().any(|p| &p.port_name == port);
            if !present && !allocation.is_stale {
                tracing::warn!(port = %port, "allocated port vanished from enumeration");
            }
            allocation.is_stale = !present;
        }
        let count = state.known_ports.len();
        drop(state);
        count
    }

    /// Releases everything and refuses further grants. Subsequent calls
    /// return `None`/`false` without panicking.
    pub fn dispose(&self) {
        let ports: Vec<String> = {
            let state = self.state.lock().unwrap();
            state.active.keys().cloned().collect()
        };
        for port in ports {
            self.release(&port, None);
        }
        self.state.lock().unwrap().disposed = true;
        tracing::debug!("port pool disposed");
    }
}
