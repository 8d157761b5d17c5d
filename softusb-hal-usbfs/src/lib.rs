//! Host transport over Linux usbfs.
//!
//! Devices are discovered from `/sys/bus/usb/devices` and opened at
//! `/dev/bus/usb/BBB/DDD`; hotplug arrives on a
//! `NETLINK_KOBJECT_UEVENT` socket; a single epoll worker (via mio)
//! multiplexes the netlink socket, a wakeup, and every open device
//! descriptor. Control and bulk transfers use the synchronous usbfs
//! ioctls; interrupt transfers go through per-endpoint URB pools that
//! are reaped when epoll reports the device descriptor ready.
//!
//! The kernel has already enumerated and addressed every device this
//! transport can open, so the bus-level reset and address assignment
//! the host core performs are tracked but not re-issued on the wire.

#[cfg(target_os = "linux")]
pub mod host;
#[cfg(target_os = "linux")]
mod poller;
#[cfg(target_os = "linux")]
pub mod sysfs;
#[cfg(target_os = "linux")]
pub mod uevent;
#[cfg(target_os = "linux")]
mod urb;
#[cfg(target_os = "linux")]
mod usbfs;

#[cfg(target_os = "linux")]
pub use host::UsbfsHostHal;
