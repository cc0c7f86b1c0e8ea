//! Bit-bang GPIO over FTDI data-bus pins.
//!
//! A BIB may wire power-sequencing and fail-signal lines to the spare pins
//! of an FTDI chip. The [`BitBangProvider`] trait is the seam: the real
//! implementation drives the chip's bit-bang mode, the [`NullBitBang`]
//! stands in when no hardware is configured (outputs no-op, inputs read
//! false) so workflow decisions stay identical either way.

pub mod bitbang;
pub mod poller;

pub use bitbang::{FakeBitBangHandle, FtdiBitBang, NusbBitBangDriver};
pub use poller::GpioPoller;

use std::time::{Duration, SystemTime};

/// Well-known input line: the bench signals the UUT is powered and ready.
pub const INPUT_POWER_ON_READY: &str = "power_on_ready";
/// Well-known input line: the bench is about to cut power.
pub const INPUT_POWER_DOWN_HEADS_UP: &str = "power_down_heads_up";
/// Well-known output line: raised on CRITICAL validation results.
pub const OUTPUT_CRITICAL_FAIL: &str = "critical_fail";

/// Errors from the GPIO layer.
#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    /// The named line is not configured or no hardware is attached.
    #[error("bit-bang hardware unavailable: {0}")]
    HardwareUnavailable(String),
    /// The USB transfer to the chip failed.
    #[error("bit-bang I/O failed")]
    Io(#[source] std::io::Error),
}

/// A debounced input transition reported by the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    /// Logical line name.
    pub name: String,
    /// New logical value (polarity already applied).
    pub value: bool,
    /// When the transition was accepted.
    pub at: SystemTime,
}

/// Capability set of the bit-bang interface.
///
/// Calls block for the duration of one short USB transfer; async callers
/// run them on the blocking pool. Output writes on one device are
/// serialized by the implementation.
pub trait BitBangProvider: Send + Sync {
    /// Reads one input line by name.
    fn read_input(&self, name: &str) -> Result<bool, GpioError>;

    /// Drives one output line by name. `value` is logical; polarity is
    /// applied by the implementation.
    fn write_output(&self, name: &str, value: bool) -> Result<(), GpioError>;

    /// Asserts an output for `duration`, then deasserts it.
    fn pulse_output(&self, name: &str, duration: Duration) -> Result<(), GpioError>;

    /// Samples all configured input lines in one bus read.
    fn sample_inputs(&self) -> Result<Vec<(String, bool)>, GpioError>;

    /// The power-on-ready input.
    fn read_power_on_ready(&self) -> Result<bool, GpioError> {
        self.read_input(INPUT_POWER_ON_READY)
    }

    /// The power-down-heads-up input.
    fn read_power_down_heads_up(&self) -> Result<bool, GpioError> {
        self.read_input(INPUT_POWER_DOWN_HEADS_UP)
    }

    /// Raises or clears the critical-fail signal.
    fn set_critical_fail_signal(&self, asserted: bool) -> Result<(), GpioError> {
        self.write_output(OUTPUT_CRITICAL_FAIL, asserted)
    }

    /// Periodic housekeeping driven by the poller (auto-clear timers).
    fn maintain(&self) -> Result<(), GpioError> {
        Ok(())
    }
}

/// Provider used when no bit-bang hardware is configured.
///
/// All outputs silently succeed and all inputs read false, so the
/// orchestrator takes the same decisions with or without hardware.
#[derive(Debug, Default)]
pub struct NullBitBang;

impl NullBitBang {
    /// Creates the null provider.
    pub fn new() -> Self {
        Self
    }
}

impl BitBangProvider for NullBitBang {
    fn read_input(&self, _name: &str) -> Result<bool, GpioError> {
        Ok(false)
    }

    fn write_output(&self, _name: &str, _value: bool) -> Result<(), GpioError> {
        Ok(())
    }

    fn pulse_output(&self, _name: &str, _duration: Duration) -> Result<(), GpioError> {
        Ok(())
    }

    fn sample_inputs(&self) -> Result<Vec<(String, bool)>, GpioError> {
        Ok(Vec::new())
    }
}
