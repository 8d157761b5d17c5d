//! A software bus: the wire between host and device rendered as framed
//! messages over named pipes in a shared directory.
//!
//! Each device owns a `device-<uuid>` subdirectory holding one FIFO per
//! channel (`connection`, `host_to_device`, `device_to_host`,
//! `interrupts`, and `ep1_in` through `ep15_out`). The framing and
//! message grammar live in [`message`]; [`device`] and [`host`]
//! implement the two HAL contracts over it. Because the byte sequences
//! are symmetric, the two sides interoperate across process boundaries,
//! which is what the integration suite builds on.
//!
//! POSIX named pipes are the substrate, so this transport is Unix-only.

#[cfg(unix)]
pub mod device;
#[cfg(unix)]
pub mod host;
pub mod message;
#[cfg(unix)]
mod pipes;

#[cfg(unix)]
pub use device::FifoDeviceHal;
#[cfg(unix)]
pub use host::FifoHostHal;
