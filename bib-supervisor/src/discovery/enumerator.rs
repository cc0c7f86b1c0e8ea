//! Listing serial ports of the host system.

use std::sync::Mutex;

use serialport::SerialPortType;

use crate::discovery::ftdi::{FtdiIdentity, FTDI_VID};
use crate::discovery::{PortInfo, PortStatus};

/// Produces snapshots of the OS-visible serial ports.
///
/// Enumeration is idempotent and uncached; every call asks the OS again.
/// Implementations degrade instead of failing: a port that cannot be
/// described is skipped with a warning and the rest of the snapshot stands.
pub trait PortEnumerator: Send + Sync {
    /// Returns the current snapshot of serial ports.
    fn enumerate(&self) -> Vec<PortInfo>;
}

/// Default enumerator over the operating system's serial port list.
#[derive(Debug, Default)]
pub struct SystemPortEnumerator;

impl SystemPortEnumerator {
    /// Creates a new enumerator.
    pub fn new() -> Self {
        Self
    }
}

impl PortEnumerator for SystemPortEnumerator {
    #[tracing::instrument(skip_all)]
    fn enumerate(&self) -> Vec<PortInfo> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!("error listing serial ports: {e}");
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => {
                    let serial = usb.serial_number.as_deref().unwrap_or("");
                    let is_ftdi = usb.vid == FTDI_VID;
                    let (device_id, identity) = if is_ftdi {
                        let identity = FtdiIdentity::from_usb(usb.vid, usb.pid, serial);
                        (identity.device_id(), Some(identity))
                    } else {
                        // Serial-less devices fall back to the port name so
                        // the grouping key stays unique per endpoint.
                        let suffix = if serial.is_empty() { &port.port_name } else { serial };
                        (
                            format!("USB\\VID_{:04X}&PID_{:04X}\\{suffix}", usb.vid, usb.pid),
                            None,
                        )
                    };
                    PortInfo {
                        port_name: port.port_name,
                        friendly_name: usb.product.clone(),
                        device_id,
                        status: PortStatus::Unknown,
                        is_ftdi,
                        identity,
                        validation: None,
                    }
                }
                _ => PortInfo {
                    device_id: port.port_name.clone(),
                    port_name: port.port_name,
                    friendly_name: None,
                    status: PortStatus::Unknown,
                    is_ftdi: false,
                    identity: None,
                    validation: None,
                },
            })
            .collect()
    }
}

/// Scripted enumerator for tests and hosts without hardware.
#[derive(Debug, Default)]
pub struct FakePortEnumerator {
    ports: Mutex<Vec<PortInfo>>,
}

impl FakePortEnumerator {
    /// Creates an enumerator with an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot returned by [`PortEnumerator::enumerate`].
    pub fn set_ports(&self, ports: Vec<PortInfo>) {
        *self.ports.lock().unwrap() = ports;
    }

    /// Appends one port to the snapshot.
    pub fn push(&self, port: PortInfo) {
        self.ports.lock().unwrap().push(port);
    }
}

impl PortEnumerator for FakePortEnumerator {
    fn enumerate(&self) -> Vec<PortInfo> {
        self.ports.lock().unwrap().clone()
    }
}

/// Builds a fake FTDI-backed [`PortInfo`] for tests.
pub fn fake_ftdi_port(port_name: &str, serial: &str, pid: u16) -> PortInfo {
    let identity = FtdiIdentity::from_usb(FTDI_VID, pid, serial);
    PortInfo {
        port_name: port_name.to_owned(),
        friendly_name: Some(format!("USB Serial Port ({port_name})")),
        device_id: identity.device_id(),
        status: PortStatus::Available,
        is_ftdi: true,
        identity: Some(identity),
        validation: None,
    }
}

/// Builds a fake non-FTDI [`PortInfo`] for tests.
pub fn fake_plain_port(port_name: &str) -> PortInfo {
    PortInfo {
        port_name: port_name.to_owned(),
        friendly_name: None,
        device_id: port_name.to_owned(),
        status: PortStatus::Available,
        is_ftdi: false,
        identity: None,
        validation: None,
    }
}
