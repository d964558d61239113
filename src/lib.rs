//! This crate exposes the GPIO block of a [Raspberry Pi](https://www.raspberrypi.com/) to
//! several processes at once through a small server.
//!
//! The server maps the peripheral registers, serves a directory of pin nodes plus a control
//! node over a Unix socket, runs an interrupt service thread which notifies clients about
//! pin transitions, and drives the SPI0 and PWM peripherals on behalf of its clients.
//!
//! Pins are numbered the BCM way. Use `HeaderPin` to go from a position on the 40-pin
//! header to a `Pin`.
//!
//! Clients use `Session`, which speaks the structured protocol to the control node and
//! receives event notifications on a background thread. Pins obtained from a session
//! implement the [`embedded_hal`](https://crates.io/crates/embedded-hal) digital traits, so
//! drivers written against `embedded_hal` can run against a remote board.
//!
//! Both BCM2835-family (Pi 3) and BCM2711 (Pi 4) boards are supported. The SoC is derived
//! from the peripheral base address.

use std::io;
use thiserror::Error;

pub mod client;
pub mod config;
pub mod device;
pub mod event;
pub mod pin_map;
pub mod protocol;
pub mod pwm;
pub mod server;
pub mod spi;

pub use client::{Node, RemoteInputPin, RemoteOutputPin, Session};
pub use device::error::{DeviceError, RequestError};
pub use device::pin::{Function, Level, Pull, Trigger};
pub use device::Device;
pub use event::Notification;
pub use pin_map::{HeaderPin, Pin, MAX_PINS};

/// Identifies one open handle on the server. Never zero.
pub type ClientId = u64;

/// Main error type for this crate.
///
/// For more details, see `RequestError` and `DeviceError` enums documentation.
#[derive(Error, Debug)]
pub enum GpioError {
    #[error("request rejected by the GPIO server")]
    Request(#[source] RequestError),
    #[error("error while operating on a device")]
    Device(#[source] DeviceError),
    #[error("failed to connect to the GPIO server")]
    ConnectionFailed(#[source] io::Error),
    #[error("i/o error while talking to the GPIO server")]
    Io(#[source] io::Error),
    #[error("unexpected reply from the GPIO server")]
    Protocol,
}

impl From<RequestError> for GpioError {
    fn from(err: RequestError) -> Self {
        GpioError::Request(err)
    }
}

impl From<DeviceError> for GpioError {
    fn from(err: DeviceError) -> Self {
        GpioError::Device(err)
    }
}

impl From<io::Error> for GpioError {
    fn from(err: io::Error) -> Self {
        GpioError::Io(err)
    }
}

pub type GpioResult<T> = Result<T, GpioError>;
