//! Time-bounded client reservations over the pool.
//!
//! A reservation wraps one pool allocation with an owner and an expiry.
//! Expired reservations are equivalent to released ones: a background
//! sweeper frees the underlying allocation and cancels any workflow still
//! holding the reservation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::discovery::validator::{validate, ValidationConfig};
use crate::pool::{new_token, PortAllocation, PortPool};
use crate::validation::ValidationLevel;

/// Default reservation lifetime.
pub const DEFAULT_RESERVATION: Duration = Duration::from_secs(30 * 60);

/// Errors from the reservation layer.
#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    /// No free port satisfied the criteria.
    #[error("no port available matching the reservation criteria")]
    NoPortAvailable,
    /// The requested port is held by another allocation.
    #[error("port '{0}' is in use")]
    PortInUse(String),
    /// The requested port failed the eligibility check.
    #[error("port '{0}' failed validation")]
    ValidationFailed(String),
    /// The reservation has expired.
    #[error("reservation '{0}' has expired")]
    ReservationExpired(String),
}

/// What a client asks for when reserving a port.
#[derive(Debug, Clone)]
pub struct ReservationCriteria {
    /// Owner of the reservation.
    pub client_id: String,
    /// Lifetime before the reservation expires.
    pub duration: Duration,
    /// Optional eligibility gate applied during allocation.
    pub validation: Option<ValidationConfig>,
}

impl ReservationCriteria {
    /// Criteria with the default lifetime and no validation gate.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            duration: DEFAULT_RESERVATION,
            validation: None,
        }
    }

    /// Adds an eligibility gate.
    pub fn with_validation(mut self, config: ValidationConfig) -> Self {
        self.validation = Some(config);
        self
    }

    /// Overrides the lifetime.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// A granted reservation.
#[derive(Debug, Clone)]
pub struct PortReservation {
    /// Unique reservation id.
    pub reservation_id: String,
    /// The wrapped pool allocation.
    pub allocation: PortAllocation,
    /// Owner; release requests must name the same client.
    pub client_id: String,
    /// When the reservation lapses.
    pub expires_at: Instant,
}

impl PortReservation {
    /// Whether the reservation has lapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct ReservationEntry {
    reservation: PortReservation,
    cancel: Option<CancellationToken>,
}

/// Reservation bookkeeping over a [`PortPool`].
pub struct ReservationService {
    pool: Arc<PortPool>,
    state: Mutex<HashMap<String, ReservationEntry>>,
}

impl ReservationService {
    /// Creates the service over a pool.
    pub fn new(pool: Arc<PortPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped pool.
    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Reserves the first eligible free port.
    pub fn reserve(
        &self,
        criteria: &ReservationCriteria,
    ) -> Result<PortReservation, ReservationError> {
        let allocation = self
            .pool
            .allocate(criteria.validation.as_ref(), Some(&criteria.client_id))
            .ok_or(ReservationError::NoPortAvailable)?;
        Ok(self.record(allocation, criteria))
    }

    /// Reserves a specific port by name.
    pub fn reserve_port(
        &self,
        port_name: &str,
        criteria: &ReservationCriteria,
    ) -> Result<PortReservation, ReservationError> {
        if self.pool.is_allocated(port_name) {
            return Err(ReservationError::PortInUse(port_name.to_owned()));
        }
        if let Some(config) = &criteria.validation {
            let port = self
                .pool
                .find_port(port_name)
                .ok_or(ReservationError::NoPortAvailable)?;
            if validate(&port, config).level != ValidationLevel::Pass {
                return Err(ReservationError::ValidationFailed(port_name.to_owned()));
            }
        }
        let allocation = self
            .pool
            .allocate_named(port_name, criteria.validation.as_ref(), Some(&criteria.client_id))
            .ok_or_else(|| ReservationError::PortInUse(port_name.to_owned()))?;
        Ok(self.record(allocation, criteria))
    }

    fn record(
        &self,
        allocation: PortAllocation,
        criteria: &ReservationCriteria,
    ) -> PortReservation {
        let reservation = PortReservation {
            reservation_id: new_token(),
            allocation,
            client_id: criteria.client_id.clone(),
            expires_at: Instant::now() + criteria.duration,
        };
        tracing::info!(
            id = %reservation.reservation_id,
            port = %reservation.allocation.port_name,
            client = %reservation.client_id,
            "reservation granted"
        );
        self.state.lock().unwrap().insert(
            reservation.reservation_id.clone(),
            ReservationEntry {
                reservation: reservation.clone(),
                cancel: None,
            },
        );
        reservation
    }

    /// Releases a reservation after verifying ownership. Returns `false`
    /// for unknown ids or a client mismatch.
    pub fn release(&self, reservation_id: &str, client_id: &str) -> bool {
        let entry = {
            let mut state = self.state.lock().unwrap();
            match state.get(reservation_id) {
                Some(entry) if entry.reservation.client_id == client_id => {
                    state.remove(reservation_id)
                }
                Some(_) => {
                    tracing::warn!(id = %reservation_id, "release refused: wrong client");
                    return false;
                }
                None => return false,
            }
        };
        let Some(entry) = entry else { return false };
        self.pool.release(
            &entry.reservation.allocation.port_name,
            Some(&entry.reservation.allocation.session_id),
        )
    }

    /// Associates a cancellation token with a reservation so expiry can
    /// stop a workflow still holding it.
    pub fn attach_cancellation(&self, reservation_id: &str, token: CancellationToken) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.get_mut(reservation_id) {
            Some(entry) => {
                entry.cancel = Some(token);
                true
            }
            None => false,
        }
    }

    /// Looks up a reservation by id.
    pub fn get(&self, reservation_id: &str) -> Option<PortReservation> {
        self.state
            .lock()
            .unwrap()
            .get(reservation_id)
            .map(|e| e.reservation.clone())
    }

    /// Snapshot of the live reservations.
    pub fn active(&self) -> Vec<PortReservation> {
        self.state
            .lock()
            .unwrap()
            .values()
            .map(|e| e.reservation.clone())
            .collect()
    }

    /// Releases expired reservations, returning how many lapsed.
    pub fn sweep(&self) -> usize {
        let expired: Vec<ReservationEntry> = {
            let mut state = self.state.lock().unwrap();
            let ids: Vec<String> = state
                .iter()
                .filter(|(_, e)| e.reservation.is_expired())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| state.remove(&id)).collect()
        };

        for entry in &expired {
            tracing::info!(
                id = %entry.reservation.reservation_id,
                port = %entry.reservation.allocation.port_name,
                "reservation expired"
            );
            if let Some(cancel) = &entry.cancel {
                cancel.cancel();
            }
            self.pool.release(
                &entry.reservation.allocation.port_name,
                Some(&entry.reservation.allocation.session_id),
            );
        }
        expired.len()
    }

    /// Spawns the periodic expiry sweeper.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        service.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::enumerator::{fake_ftdi_port, FakePortEnumerator, PortEnumerator};
    use pretty_assertions::assert_eq;

    fn service_with_ports(names: &[&str]) -> Arc<ReservationService> {
        let enumerator = Arc::new(FakePortEnumerator::new());
        enumerator.set_ports(
            names
                .iter()
                .map(|n| fake_ftdi_port(n, &format!("SER_{n}"), 0x6011))
                .collect(),
        );
        let pool = Arc::new(PortPool::new(enumerator as Arc<dyn PortEnumerator>));
        Arc::new(ReservationService::new(pool))
    }

    #[test]
    fn reserve_then_release_leaves_statistics_unchanged() {
        let service = service_with_ports(&["COM1"]);
        let before = service.pool().statistics().allocated_ports;

        let reservation = service
            .reserve(&ReservationCriteria::new("alice"))
            .unwrap();
        assert_eq!(service.pool().statistics().allocated_ports, 1);

        assert!(service.release(&reservation.reservation_id, "alice"));
        assert_eq!(service.pool().statistics().allocated_ports, before);
        assert!(service.active().is_empty());
    }

    #[test]
    fn release_verifies_ownership() {
        let service = service_with_ports(&["COM1"]);
        let reservation = service
            .reserve(&ReservationCriteria::new("alice"))
            .unwrap();

        assert!(!service.release(&reservation.reservation_id, "mallory"));
        assert!(service.get(&reservation.reservation_id).is_some());
        assert!(service.release(&reservation.reservation_id, "alice"));
    }

    #[test]
    fn reservation_ids_are_unique_one_per_allocation() {
        let service = service_with_ports(&["COM1", "COM2"]);
        let a = service.reserve(&ReservationCriteria::new("alice")).unwrap();
        let b = service.reserve(&ReservationCriteria::new("bob")).unwrap();
        assert_ne!(a.reservation_id, b.reservation_id);
        assert_ne!(a.allocation.port_name, b.allocation.port_name);
        assert!(service.reserve(&ReservationCriteria::new("carol")).is_err());
    }

    #[test]
    fn expired_reservations_are_swept_and_freed() {
        let service = service_with_ports(&["COM1"]);
        let criteria =
            ReservationCriteria::new("alice").with_duration(Duration::from_millis(1));
        let reservation = service.reserve(&criteria).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(service.sweep(), 1);
        assert!(service.get(&reservation.reservation_id).is_none());
        assert!(!service.pool().is_allocated("COM1"));
    }

    #[test]
    fn sweep_cancels_attached_workflows() {
        let service = service_with_ports(&["COM1"]);
        let criteria =
            ReservationCriteria::new("alice").with_duration(Duration::from_millis(1));
        let reservation = service.reserve(&criteria).unwrap();

        let token = CancellationToken::new();
        assert!(service.attach_cancellation(&reservation.reservation_id, token.clone()));

        std::thread::sleep(Duration::from_millis(5));
        service.sweep();
        assert!(token.is_cancelled());
    }

    #[test]
    fn reserve_port_reports_in_use_and_validation() {
        let service = service_with_ports(&["COM1"]);

        let criteria = ReservationCriteria::new("alice");
        let first = service.reserve_port("COM1", &criteria).unwrap();
        assert_eq!(first.allocation.port_name, "COM1");

        match service.reserve_port("COM1", &ReservationCriteria::new("bob")) {
            Err(ReservationError::PortInUse(port)) => assert_eq!(port, "COM1"),
            other => panic!("expected PortInUse, got {other:?}"),
        }
    }
}
