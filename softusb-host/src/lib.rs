//! Host-side protocol core.
//!
//! A [`Host`] wraps a [`HostHal`] transport. Once started it watches
//! the transport's root ports, enumerates every device that appears
//! (reset, descriptor reads, address assignment, configuration), and
//! publishes fully configured [`HostDevice`] records to
//! [`Host::wait_device`] and the connect callback. Typed control, bulk,
//! and interrupt transfers are issued against a record and forwarded to
//! the transport with the device's assigned address.
//!
//! [`HostHal`]: softusb_core::host_hal::HostHal

pub mod device;
pub mod enumerate;
pub mod host;

pub use device::{HostDevice, ParsedConfiguration, ParsedInterface};
pub use host::Host;
