//! FTDI identity parsing and EEPROM access.
//!
//! Identities come from two places: the OS device id string
//! (`FTDIBUS\VID_xxxx+PID_xxxx+serial\...`), which is parsed without
//! touching hardware, and the chip's EEPROM, which is read over a vendor
//! control transfer and yields the `ProductDescription` used for dynamic
//! BIB selection.

use std::collections::BTreeMap;
use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The FTDI vendor id.
pub const FTDI_VID: u16 = 0x0403;

/// EEPROM field key for the product description string.
pub const KEY_PRODUCT_DESCRIPTION: &str = "ProductDescription";
/// EEPROM field key for the manufacturer string.
pub const KEY_MANUFACTURER: &str = "Manufacturer";
/// EEPROM field key for the serial number string.
pub const KEY_SERIAL_NUMBER: &str = "SerialNumber";

/// Errors from identity parsing and EEPROM access.
#[derive(Debug, thiserror::Error)]
pub enum FtdiError {
    /// The device id does not describe an FTDI device.
    #[error("'{0}' is not an FTDI device id")]
    NotFtdi(String),
    /// The device handle is claimed by another client.
    #[error("FTDI device '{0}' is busy")]
    DeviceBusy(String),
    /// The EEPROM could not be read from the device.
    #[error("EEPROM of '{device}' could not be read")]
    EepromUnreadable {
        /// Serial number of the device whose EEPROM read failed.
        device: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// FTDI chip family, derived from the USB product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChipFamily {
    /// FT232R single UART (PID 0x6001).
    FT232R,
    /// FT2232H dual UART/FIFO (PID 0x6010).
    FT2232H,
    /// FT4232H quad UART (PID 0x6011).
    FT4232H,
    /// FT232H single high-speed UART/FIFO (PID 0x6014).
    FT232H,
}

impl ChipFamily {
    /// Maps a USB product id to a chip family.
    pub fn from_pid(pid: u16) -> Option<Self> {
        match pid {
            0x6001 => Some(ChipFamily::FT232R),
            0x6010 => Some(ChipFamily::FT2232H),
            0x6011 => Some(ChipFamily::FT4232H),
            0x6014 => Some(ChipFamily::FT232H),
            _ => None,
        }
    }

    /// Number of serial ports one chip of this family exposes.
    pub fn port_count(self) -> usize {
        match self {
            ChipFamily::FT232R | ChipFamily::FT232H => 1,
            ChipFamily::FT2232H => 2,
            ChipFamily::FT4232H => 4,
        }
    }
}

impl std::fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChipFamily::FT232R => "FT232R",
            ChipFamily::FT2232H => "FT2232H",
            ChipFamily::FT4232H => "FT4232H",
            ChipFamily::FT232H => "FT232H",
        };
        f.write_str(s)
    }
}

/// EEPROM contents as string fields.
///
/// A blob is *valid* only when it was read from the device itself; a
/// placeholder synthesized from the device id alone is marked invalid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EepromBlob {
    fields: BTreeMap<String, String>,
    is_valid: bool,
}

impl EepromBlob {
    /// A blob read directly from a device.
    pub fn from_device(fields: BTreeMap<String, String>) -> Self {
        Self {
            fields,
            is_valid: true,
        }
    }

    /// A placeholder blob for a device whose EEPROM was not read.
    pub fn placeholder() -> Self {
        Self::default()
    }

    /// Whether the blob was read directly from the device.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// Looks up a field by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// The `ProductDescription` field.
    pub fn product_description(&self) -> Option<&str> {
        self.get(KEY_PRODUCT_DESCRIPTION)
    }

    /// The `Manufacturer` field.
    pub fn manufacturer(&self) -> Option<&str> {
        self.get(KEY_MANUFACTURER)
    }

    /// The `SerialNumber` field.
    pub fn serial_number(&self) -> Option<&str> {
        self.get(KEY_SERIAL_NUMBER)
    }
}

/// Identity of the FTDI chip behind a port.
///
/// All ports of one multi-port chip share a serial number; that serial is
/// the key the group analyzer clusters by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtdiIdentity {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Chip family derived from the product id.
    pub chip_family: Option<ChipFamily>,
    /// Chip serial number, shared by every port of a multi-port chip.
    pub serial_number: String,
    /// EEPROM contents, placeholder until enriched.
    pub eeprom: EepromBlob,
}

static DEVICE_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^FTDIBUS\\VID_(?P<vid>[0-9A-F]{4})\+PID_(?P<pid>[0-9A-F]{4})\+(?P<serial>[^\\]+)\\.*$")
        .unwrap()
});

impl FtdiIdentity {
    /// Parses an OS device id of the shape
    /// `FTDIBUS\VID_xxxx+PID_xxxx+serial\...` (case-insensitive).
    pub fn parse_device_id(device_id: &str) -> Result<Self, FtdiError> {
        let caps = DEVICE_ID_RE
            .captures(device_id)
            .ok_or_else(|| FtdiError::NotFtdi(device_id.to_owned()))?;

        // The regex guarantees four hex digits.
        let vendor_id = u16::from_str_radix(&caps["vid"], 16).unwrap();
        let product_id = u16::from_str_radix(&caps["pid"], 16).unwrap();

        Ok(Self {
            vendor_id,
            product_id,
            chip_family: ChipFamily::from_pid(product_id),
            serial_number: caps["serial"].to_owned(),
            eeprom: EepromBlob::placeholder(),
        })
    }

    /// Builds an identity from raw USB descriptor fields.
    pub fn from_usb(vendor_id: u16, product_id: u16, serial_number: &str) -> Self {
        Self {
            vendor_id,
            product_id,
            chip_family: ChipFamily::from_pid(product_id),
            serial_number: serial_number.to_owned(),
            eeprom: EepromBlob::placeholder(),
        }
    }

    /// Whether the vendor id is FTDI's.
    pub fn is_ftdi(&self) -> bool {
        self.vendor_id == FTDI_VID
    }

    /// Renders the OS device id this identity would enumerate under.
    pub fn device_id(&self) -> String {
        format!(
            "FTDIBUS\\VID_{:04X}+PID_{:04X}+{}\\0000",
            self.vendor_id, self.product_id, self.serial_number
        )
    }
}

/// Reads EEPROM contents for an FTDI device.
///
/// Implementations open the device by serial number; they never go through
/// the serial port, so a read can run while the port itself is closed.
pub trait EepromReader: Send + Sync {
    /// Reads the EEPROM of the device carrying `identity`.
    fn read(&self, identity: &FtdiIdentity) -> Result<EepromBlob, FtdiError>;
}

const SIO_READ_EEPROM_REQUEST: u8 = 0x90;
const EEPROM_HEADER_WORDS: u16 = 8;
const USB_TIMEOUT: Duration = Duration::from_secs(2);

/// [`EepromReader`] over a raw USB handle.
///
/// The descriptor strings of an FTDI chip mirror its EEPROM string area, so
/// `ProductDescription`, `Manufacturer` and `SerialNumber` come from the
/// device descriptors; the configuration words at the start of the EEPROM
/// are read with the vendor `SIO_READ_EEPROM` control request.
#[derive(Debug, Default)]
pub struct NusbEepromReader;

impl NusbEepromReader {
    /// Creates a reader.
    pub fn new() -> Self {
        Self
    }

    fn find_device(identity: &FtdiIdentity) -> Result<nusb::DeviceInfo, FtdiError> {
        let devices = nusb::list_devices().map_err(|source| FtdiError::EepromUnreadable {
            device: identity.serial_number.clone(),
            source,
        })?;

        devices
            .into_iter()
            .find(|d| {
                d.vendor_id() == identity.vendor_id
                    && d.product_id() == identity.product_id
                    && d.serial_number() == Some(identity.serial_number.as_str())
            })
            .ok_or_else(|| FtdiError::NotFtdi(identity.device_id()))
    }
}

impl EepromReader for NusbEepromReader {
    #[tracing::instrument(skip_all, fields(serial = %identity.serial_number))]
    fn read(&self, identity: &FtdiIdentity) -> Result<EepromBlob, FtdiError> {
        if !identity.is_ftdi() {
            return Err(FtdiError::NotFtdi(identity.device_id()));
        }

        let info = Self::find_device(identity)?;

        let mut fields = BTreeMap::new();
        if let Some(product) = info.product_string() {
            fields.insert(KEY_PRODUCT_DESCRIPTION.to_owned(), product.to_owned());
        }
        if let Some(manufacturer) = info.manufacturer_string() {
            fields.insert(KEY_MANUFACTURER.to_owned(), manufacturer.to_owned());
        }
        if let Some(serial) = info.serial_number() {
            fields.insert(KEY_SERIAL_NUMBER.to_owned(), serial.to_owned());
        }

        let device = info.open().map_err(|source| FtdiError::EepromUnreadable {
            device: identity.serial_number.clone(),
            source,
        })?;

        // Interface 0 exists on every FTDI part. A claim failure means some
        // other client holds the device.
        let interface = device
            .claim_interface(0)
            .map_err(|_| FtdiError::DeviceBusy(identity.serial_number.clone()))?;

        let mut raw = Vec::with_capacity(EEPROM_HEADER_WORDS as usize * 2);
        for word in 0..EEPROM_HEADER_WORDS {
            let mut buf = [0u8; 2];
            let read = interface
                .control_in_blocking(
                    Control {
                        control_type: ControlType::Vendor,
                        recipient: Recipient::Device,
                        request: SIO_READ_EEPROM_REQUEST,
                        value: 0,
                        index: word,
                    },
                    &mut buf,
                    USB_TIMEOUT,
                )
                .map_err(|e| FtdiError::EepromUnreadable {
                    device: identity.serial_number.clone(),
                    source: std::io::Error::other(e),
                })?;
            raw.extend_from_slice(&buf[..read]);
        }

        let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
        fields.insert("RawHeader".to_owned(), hex);

        tracing::debug!(fields = fields.len(), "EEPROM read complete");
        Ok(EepromBlob::from_device(fields))
    }
}

/// Scripted [`EepromReader`] for tests and hosts without hardware.
///
/// Maps serial numbers to blobs; unknown serials yield `EepromUnreadable`.
#[derive(Debug, Default)]
pub struct FakeEepromReader {
    blobs: std::sync::Mutex<BTreeMap<String, EepromBlob>>,
    busy: std::sync::Mutex<std::collections::BTreeSet<String>>,
}

impl FakeEepromReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device blob by serial number.
    pub fn insert(&self, serial: &str, product_description: &str) {
        let mut fields = BTreeMap::new();
        fields.insert(
            KEY_PRODUCT_DESCRIPTION.to_owned(),
            product_description.to_owned(),
        );
        fields.insert(KEY_MANUFACTURER.to_owned(), "FTDI".to_owned());
        fields.insert(KEY_SERIAL_NUMBER.to_owned(), serial.to_owned());
        self.blobs
            .lock()
            .unwrap()
            .insert(serial.to_owned(), EepromBlob::from_device(fields));
    }

    /// Marks a serial as busy; reads will fail with `DeviceBusy`.
    pub fn set_busy(&self, serial: &str, busy: bool) {
        let mut set = self.busy.lock().unwrap();
        if busy {
            set.insert(serial.to_owned());
        } else {
            set.remove(serial);
        }
    }
}

impl EepromReader for FakeEepromReader {
    fn read(&self, identity: &FtdiIdentity) -> Result<EepromBlob, FtdiError> {
        if !identity.is_ftdi() {
            return Err(FtdiError::NotFtdi(identity.device_id()));
        }
        if self.busy.lock().unwrap().contains(&identity.serial_number) {
            return Err(FtdiError::DeviceBusy(identity.serial_number.clone()));
        }
        self.blobs
            .lock()
            .unwrap()
            .get(&identity.serial_number)
            .cloned()
            .ok_or_else(|| FtdiError::EepromUnreadable {
                device: identity.serial_number.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn parses_canonical_device_id() {
        let id = FtdiIdentity::parse_device_id("FTDIBUS\\VID_0403+PID_6011+FT9A2B7CA\\0000")
            .unwrap();
        assert_eq!(id.vendor_id, 0x0403);
        assert_eq!(id.product_id, 0x6011);
        assert_eq!(id.serial_number, "FT9A2B7CA");
        assert_eq!(id.chip_family, Some(ChipFamily::FT4232H));
        assert!(!id.eeprom.is_valid());
    }

    #[test]
    fn parsing_is_case_insensitive() {
        let id = FtdiIdentity::parse_device_id("ftdibus\\vid_0403+pid_6014+abc\\0000").unwrap();
        assert_eq!(id.chip_family, Some(ChipFamily::FT232H));
    }

    #[test]
    fn rejects_non_ftdi_ids() {
        let err = FtdiIdentity::parse_device_id("USB\\VID_1234+PID_5678\\9").unwrap_err();
        assert!(matches!(err, FtdiError::NotFtdi(_)));
    }

    #[test_case(0x6001, Some(ChipFamily::FT232R); "ft232r")]
    #[test_case(0x6010, Some(ChipFamily::FT2232H); "ft2232h")]
    #[test_case(0x6011, Some(ChipFamily::FT4232H); "ft4232h")]
    #[test_case(0x6014, Some(ChipFamily::FT232H); "ft232h")]
    #[test_case(0xbeef, None; "unknown pid")]
    fn pid_table(pid: u16, family: Option<ChipFamily>) {
        assert_eq!(ChipFamily::from_pid(pid), family);
    }

    #[test]
    fn device_id_round_trips() {
        let id = FtdiIdentity::from_usb(0x0403, 0x6011, "AAA");
        let reparsed = FtdiIdentity::parse_device_id(&id.device_id()).unwrap();
        assert_eq!(reparsed.serial_number, "AAA");
        assert_eq!(reparsed.product_id, 0x6011);
    }

    #[test]
    fn fake_reader_reports_busy() {
        let reader = FakeEepromReader::new();
        reader.insert("AAA", "client_demo");
        reader.set_busy("AAA", true);
        let identity = FtdiIdentity::from_usb(FTDI_VID, 0x6011, "AAA");
        assert!(matches!(
            reader.read(&identity),
            Err(FtdiError::DeviceBusy(_))
        ));

        reader.set_busy("AAA", false);
        let blob = reader.read(&identity).unwrap();
        assert!(blob.is_valid());
        assert_eq!(blob.product_description(), Some("client_demo"));
    }
}
