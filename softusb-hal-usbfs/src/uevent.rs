//! Kernel hotplug events from a `NETLINK_KOBJECT_UEVENT` socket.
//!
//! Each datagram is a NUL-separated sequence of lines: the first is
//! `action@devpath`, the rest are `KEY=VALUE` pairs.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

const NETLINK_KOBJECT_UEVENT: libc::c_int = 15;

/// Multicast group 1 carries the kernel's uevent broadcast.
const UEVENT_GROUP_KERNEL: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
    Change,
    Bind,
    Unbind,
}

impl UeventAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "change" => Some(Self::Change),
            "bind" => Some(Self::Bind),
            "unbind" => Some(Self::Unbind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Uevent {
    pub action: UeventAction,
    pub devpath: String,
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
    pub busnum: Option<u8>,
    pub devnum: Option<u8>,
}

impl Uevent {
    /// Only `SUBSYSTEM=usb` + `DEVTYPE=usb_device` events matter here;
    /// interface add/remove and other subsystems are noise.
    pub fn is_usb_device(&self) -> bool {
        self.subsystem.as_deref() == Some("usb")
            && self.devtype.as_deref() == Some("usb_device")
    }

    /// Last component of the devpath, which for a USB device is its
    /// sysfs entry name (`1-4`, `2-1.3`, ...).
    pub fn sysfs_name(&self) -> Option<&str> {
        self.devpath.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

/// Parse one uevent datagram. `None` for malformed or libudev-format
/// messages (those start with "libudev" instead of `action@devpath`).
pub fn parse(datagram: &[u8]) -> Option<Uevent> {
    let mut lines = datagram
        .split(|b| *b == 0)
        .filter(|l| !l.is_empty())
        .map(|l| String::from_utf8_lossy(l).into_owned());

    let first = lines.next()?;
    let (action, devpath) = first.split_once('@')?;
    let action = UeventAction::parse(action)?;

    let mut event = Uevent {
        action,
        devpath: devpath.to_owned(),
        subsystem: None,
        devtype: None,
        busnum: None,
        devnum: None,
    };
    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "SUBSYSTEM" => event.subsystem = Some(value.to_owned()),
            "DEVTYPE" => event.devtype = Some(value.to_owned()),
            "BUSNUM" => event.busnum = value.parse().ok(),
            "DEVNUM" => event.devnum = value.parse().ok(),
            _ => {}
        }
    }
    Some(event)
}

/// Open the uevent socket, non-blocking, subscribed to the kernel
/// group.
pub(crate) fn open_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2)/bind(2) with a stack sockaddr_nl.
    unsafe {
        let fd = libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            NETLINK_KOBJECT_UEVENT,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = OwnedFd::from_raw_fd(fd);

        let mut addr: libc::sockaddr_nl = std::mem::zeroed();
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = 0;
        addr.nl_groups = UEVENT_GROUP_KERNEL;
        let rc = libc::bind(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        );
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

/// Drain one datagram; `Ok(None)` when nothing is queued.
pub(crate) fn recv(
    fd: &OwnedFd,
    buf: &mut [u8],
) -> io::Result<Option<usize>> {
    // SAFETY: recv(2) into a caller-owned buffer.
    let n = unsafe {
        libc::recv(
            std::os::fd::AsRawFd::as_raw_fd(fd),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(n as usize))
}

#[cfg(test)]
#[path = "tests/uevent.rs"]
mod tests;
