//! Serial port discovery and enrichment.
//!
//! Discovery is a pipeline: the [`PortEnumerator`] produces a snapshot of
//! OS-visible ports, the FTDI layer parses device identities and reads
//! EEPROM contents, the [`SystemInfoCache`] absorbs the cost of repeated
//! EEPROM reads, the eligibility [`validator`] scores each port, and the
//! [`grouping`] analyzer folds ports that share one FTDI chip into physical
//! device groups.

pub mod cache;
pub mod enumerator;
pub mod ftdi;
pub mod grouping;
pub mod validator;

pub use cache::{CacheStatistics, SystemInfo, SystemInfoCache};
pub use enumerator::{FakePortEnumerator, PortEnumerator, SystemPortEnumerator};
pub use ftdi::{ChipFamily, EepromBlob, EepromReader, FakeEepromReader, FtdiError, FtdiIdentity};
pub use grouping::{analyze, DeviceGroup, GroupSnapshot};
pub use validator::{validate, ValidationConfig};

use crate::validation::ValidationOutcome;

/// Reported availability of an enumerated port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortStatus {
    /// The port exists and is not known to be open elsewhere.
    Available,
    /// The port is open by some process.
    InUse,
    /// The OS reported the port in an error state.
    Error,
    /// Nothing is known about the port's state.
    #[default]
    Unknown,
}

/// One OS-visible serial endpoint, immutable after the enumeration snapshot
/// that produced it.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Stable OS identifier, e.g. `COM3` or `/dev/ttyUSB0`.
    pub port_name: String,
    /// OS-supplied human readable description, if any.
    pub friendly_name: Option<String>,
    /// OS device id. For FTDI-backed ports this follows the
    /// `FTDIBUS\VID_xxxx+PID_xxxx+serial\...` convention.
    pub device_id: String,
    /// Reported availability.
    pub status: PortStatus,
    /// Whether the underlying bridge is an FTDI chip.
    pub is_ftdi: bool,
    /// Parsed FTDI identity, when the device id could be parsed.
    pub identity: Option<FtdiIdentity>,
    /// Eligibility outcome attached by the validator, if it ran.
    pub validation: Option<ValidationOutcome>,
}

impl PortInfo {
    /// The key the group analyzer partitions by: the FTDI serial when
    /// present and non-empty, otherwise the OS device id.
    pub fn grouping_key(&self) -> &str {
        match &self.identity {
            Some(identity) if !identity.serial_number.is_empty() => &identity.serial_number,
            _ => &self.device_id,
        }
    }
}
