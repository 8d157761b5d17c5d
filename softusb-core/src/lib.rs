//! Transport-independent core of the SoftUSB protocol stack.
//!
//! This crate holds everything both sides of the wire agree on: the
//! bit-exact USB 2.0 chapter-9 structures and their parsers and
//! marshallers ([`wire`]), the shared type vocabulary ([`types`]), the
//! error taxonomy ([`error`]), cooperative cancellation ([`context`]),
//! and the two hardware-abstraction contracts that the device core
//! ([`device_hal`]) and the host core ([`host_hal`]) consume.
//!
//! Nothing in here performs I/O. Concrete transports live in the HAL
//! crates (`softusb-hal-fifo`, `softusb-hal-usbfs`); the protocol state
//! machines live in `softusb-device` and `softusb-host`.

pub mod context;
pub mod device_hal;
pub mod error;
pub mod host_hal;
pub mod types;
pub mod wire;

pub use context::Context;
pub use error::{TransportError, UsbError};
pub use types::{DeviceState, Direction, EndpointType, UsbSpeed};
