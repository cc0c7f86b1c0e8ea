//! FTDI bit-bang driver and provider.
//!
//! The driver trait covers the two operations the provider needs: read the
//! pin states and drive the output latch. The real driver talks to the
//! chip with FTDI's vendor control requests over `nusb`; a fake driver
//! backs the tests.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nusb::transfer::{Control, ControlType, Recipient};

use crate::config::bib::BitBangConfig;
use crate::gpio::{BitBangProvider, GpioError, OUTPUT_CRITICAL_FAIL};

const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;
const SIO_READ_PINS_REQUEST: u8 = 0x0C;
const BITMODE_BITBANG: u8 = 0x01;
const USB_TIMEOUT: Duration = Duration::from_secs(1);

/// Raw pin access on one FTDI interface in bit-bang mode.
pub trait BitBangDriver: Send {
    /// Reads the current state of the eight data-bus pins.
    fn read_pins(&mut self) -> Result<u8, GpioError>;

    /// Drives the output latch.
    fn write_pins(&mut self, value: u8) -> Result<(), GpioError>;
}

/// [`BitBangDriver`] over raw USB vendor requests.
pub struct NusbBitBangDriver {
    interface: nusb::Interface,
}

impl NusbBitBangDriver {
    /// Opens the FTDI device with the given serial and puts it into
    /// bit-bang mode with `direction_mask` marking the output pins.
    pub fn open(serial: &str, direction_mask: u8) -> Result<Self, GpioError> {
        let devices = nusb::list_devices().map_err(GpioError::Io)?;
        let info = devices
            .into_iter()
            .find(|d| {
                d.vendor_id() == crate::discovery::ftdi::FTDI_VID
                    && d.serial_number() == Some(serial)
            })
            .ok_or_else(|| GpioError::HardwareUnavailable(serial.to_owned()))?;

        let device = info.open().map_err(GpioError::Io)?;
        let interface = device
            .claim_interface(0)
            .map_err(|e| GpioError::Io(std::io::Error::other(e)))?;

        let mut driver = Self { interface };
        driver.set_bitmode(direction_mask, BITMODE_BITBANG)?;
        Ok(driver)
    }

    fn set_bitmode(&mut self, mask: u8, mode: u8) -> Result<(), GpioError> {
        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: SIO_SET_BITMODE_REQUEST,
                    value: u16::from_le_bytes([mask, mode]),
                    index: 1,
                },
                &[],
                USB_TIMEOUT,
            )
            .map_err(|e| GpioError::Io(std::io::Error::other(e)))?;
        Ok(())
    }
}

impl BitBangDriver for NusbBitBangDriver {
    fn read_pins(&mut self) -> Result<u8, GpioError> {
        let mut buf = [0u8; 1];
        let read = self
            .interface
            .control_in_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: SIO_READ_PINS_REQUEST,
                    value: 0,
                    index: 1,
                },
                &mut buf,
                USB_TIMEOUT,
            )
            .map_err(|e| GpioError::Io(std::io::Error::other(e)))?;
        if read != 1 {
            return Err(GpioError::Io(std::io::Error::other("short pin read")));
        }
        Ok(buf[0])
    }

    fn write_pins(&mut self, value: u8) -> Result<(), GpioError> {
        // In asynchronous bit-bang mode a bulk write drives the latch.
        let completion =
            futures_lite::future::block_on(self.interface.bulk_out(0x02, vec![value]));
        completion
            .status
            .map_err(|e| GpioError::Io(std::io::Error::other(e)))?;
        Ok(())
    }
}

/// In-memory [`BitBangDriver`] plus the handle tests poke it through.
#[derive(Clone, Default)]
pub struct FakeBitBangHandle {
    pins: Arc<AtomicU8>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl FakeBitBangHandle {
    /// Creates a driver/handle pair.
    pub fn new() -> (FakeBitBangDriver, FakeBitBangHandle) {
        let handle = FakeBitBangHandle::default();
        (
            FakeBitBangDriver {
                handle: handle.clone(),
            },
            handle,
        )
    }

    /// Sets one physical pin level.
    pub fn set_pin(&self, bit: u8, high: bool) {
        let mask = 1u8 << bit;
        if high {
            self.pins.fetch_or(mask, Ordering::SeqCst);
        } else {
            self.pins.fetch_and(!mask, Ordering::SeqCst);
        }
    }

    /// The latch values written so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// The most recent latch value, if any write happened.
    pub fn last_written(&self) -> Option<u8> {
        self.written.lock().unwrap().last().copied()
    }
}

/// Driver half of [`FakeBitBangHandle::new`].
pub struct FakeBitBangDriver {
    handle: FakeBitBangHandle,
}

impl BitBangDriver for FakeBitBangDriver {
    fn read_pins(&mut self) -> Result<u8, GpioError> {
        Ok(self.handle.pins.load(Ordering::SeqCst))
    }

    fn write_pins(&mut self, value: u8) -> Result<(), GpioError> {
        self.handle.written.lock().unwrap().push(value);
        // Driven outputs read back on the bus.
        self.handle.pins.store(value, Ordering::SeqCst);
        Ok(())
    }
}

struct DriverState {
    driver: Box<dyn BitBangDriver>,
    latch: u8,
}

/// [`BitBangProvider`] over one FTDI chip.
pub struct FtdiBitBang {
    config: BitBangConfig,
    state: Mutex<DriverState>,
    clear_at: Mutex<Option<Instant>>,
}

impl FtdiBitBang {
    /// Creates the provider over an already-opened driver. Outputs are
    /// driven to their deasserted level immediately.
    pub fn new(config: BitBangConfig, driver: Box<dyn BitBangDriver>) -> Result<Self, GpioError> {
        let mut latch = 0u8;
        for output in &config.outputs {
            // Deasserted: high for active-low lines, low otherwise.
            if output.active_low {
                latch |= 1 << output.bit;
            }
        }
        let provider = Self {
            config,
            state: Mutex::new(DriverState { driver, latch }),
            clear_at: Mutex::new(None),
        };
        provider.state.lock().unwrap().write_latch()?;
        Ok(provider)
    }

    /// Opens the configured FTDI device and creates the provider.
    pub fn open(config: BitBangConfig) -> Result<Self, GpioError> {
        let serial = config
            .serial
            .clone()
            .ok_or_else(|| GpioError::HardwareUnavailable("no serial configured".to_owned()))?;
        let direction: u8 = config.outputs.iter().fold(0, |mask, o| mask | 1 << o.bit);
        let driver = NusbBitBangDriver::open(&serial, direction)?;
        Self::new(config, Box::new(driver))
    }

    /// The configuration the provider was built from.
    pub fn config(&self) -> &BitBangConfig {
        &self.config
    }

    fn set_output(&self, name: &str, value: bool) -> Result<(), GpioError> {
        let output = self
            .config
            .output(name)
            .ok_or_else(|| GpioError::HardwareUnavailable(name.to_owned()))?;
        let physical_high = value != output.active_low;
        let mut state = self.state.lock().unwrap();
        if physical_high {
            state.latch |= 1 << output.bit;
        } else {
            state.latch &= !(1 << output.bit);
        }
        state.write_latch()?;
        tracing::debug!(line = name, value, "output driven");
        Ok(())
    }
}

impl DriverState {
    fn write_latch(&mut self) -> Result<(), GpioError> {
        let latch = self.latch;
        self.driver.write_pins(latch)
    }
}

impl BitBangProvider for FtdiBitBang {
    fn read_input(&self, name: &str) -> Result<bool, GpioError> {
        let input = self
            .config
            .input(name)
            .ok_or_else(|| GpioError::HardwareUnavailable(name.to_owned()))?;
        let pins = self.state.lock().unwrap().driver.read_pins()?;
        let physical_high = pins & (1 << input.bit) != 0;
        Ok(physical_high != input.active_low)
    }

    fn write_output(&self, name: &str, value: bool) -> Result<(), GpioError> {
        self.set_output(name, value)
    }

    fn pulse_output(&self, name: &str, duration: Duration) -> Result<(), GpioError> {
        let width = self
            .config
            .output(name)
            .and_then(|o| o.pulse_width)
            .unwrap_or(duration);
        self.set_output(name, true)?;
        std::thread::sleep(width);
        self.set_output(name, false)
    }

    fn sample_inputs(&self) -> Result<Vec<(String, bool)>, GpioError> {
        let pins = self.state.lock().unwrap().driver.read_pins()?;
        Ok(self
            .config
            .inputs
            .iter()
            .map(|input| {
                let physical_high = pins & (1 << input.bit) != 0;
                (input.name.clone(), physical_high != input.active_low)
            })
            .collect())
    }

    fn set_critical_fail_signal(&self, asserted: bool) -> Result<(), GpioError> {
        self.set_output(OUTPUT_CRITICAL_FAIL, asserted)?;
        *self.clear_at.lock().unwrap() = if asserted && self.config.auto_clear {
            Some(Instant::now() + self.config.signal_hold)
        } else {
            None
        };
        Ok(())
    }

    fn maintain(&self) -> Result<(), GpioError> {
        let due = {
            let clear_at = self.clear_at.lock().unwrap();
            clear_at.is_some_and(|at| Instant::now() >= at)
        };
        if due {
            tracing::debug!("auto-clearing critical fail signal");
            self.set_output(OUTPUT_CRITICAL_FAIL, false)?;
            *self.clear_at.lock().unwrap() = None;
        }
        Ok(())
    }
}
