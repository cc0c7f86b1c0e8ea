#![warn(missing_docs)]

use crate::config::ConfigError;
use crate::discovery::ftdi::FtdiError;
use crate::gpio::GpioError;
use crate::pool::reservation::ReservationError;
use crate::protocol::ProtocolError;

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error occurred during device discovery or EEPROM access.
    #[error("a device discovery error occurred")]
    Discovery(#[from] FtdiError),
    /// An error occurred while loading or watching configuration.
    #[error("a configuration error occurred")]
    Config(#[from] ConfigError),
    /// An error occurred in a protocol session.
    #[error("a protocol error occurred")]
    Protocol(#[from] ProtocolError),
    /// An error occurred in the bit-bang GPIO layer.
    #[error("a GPIO error occurred")]
    Gpio(#[from] GpioError),
    /// An error occurred in the reservation layer.
    #[error("a reservation error occurred")]
    Reservation(#[from] ReservationError),
    /// The power-on-ready input did not assert within its timeout.
    #[error("power-on-ready was not signalled in time")]
    PowerOnReadyTimeout,
    /// The bench requested a power-down while a workflow was running.
    #[error("power-down was requested by the bench")]
    PowerDownRequested,
    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
    /// Any other error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
