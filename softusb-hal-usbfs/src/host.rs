//! The [`HostHal`] implementation over usbfs.

use crate::poller::{self, Poller, UEVENT_TOKEN};
use crate::sysfs::{self, SysfsDevice};
use crate::uevent::{self, UeventAction};
use crate::urb::{UrbPool, URB_BUFFER_SIZE};
use crate::usbfs;
use log::{debug, trace, warn};
use nix::errno::Errno;
use softusb_core::context::Context;
use softusb_core::error::{transport, TransportError, UsbError};
use softusb_core::host_hal::{DataPhase, HostHal, PortEvent};
use softusb_core::types::Direction;
use softusb_core::wire::{self, Recipient, RequestKind, SetupPacket};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::raw::{c_int, c_uint, c_void};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Width of the device pool (and so of the virtual root hub). Ports
/// are numbered from 1 and must fit the host core's 32-bit port set.
pub const MAX_DEVICES: usize = 31;

const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

struct UsbfsDevice {
    port: u8,
    fd: OwnedFd,
    info: SysfsDevice,
    /// The address the host core assigned; the kernel already addressed
    /// the device, so this is bookkeeping only.
    address: AtomicU8,
    /// Bitmask of interface numbers claimed for usbfs.
    claimed: Mutex<u32>,
    disconnected: AtomicBool,
    /// Per-endpoint URB pools, created on first use.
    pools: Mutex<HashMap<u8, Arc<UrbPool>>>,
}

impl UsbfsDevice {
    fn raw_fd(&self) -> c_int {
        self.fd.as_raw_fd()
    }

    fn pool(&self, ep_address: u8, urb_type: u8) -> Arc<UrbPool> {
        self.pools
            .lock()
            .unwrap()
            .entry(ep_address)
            .or_insert_with(|| Arc::new(UrbPool::new(ep_address, urb_type)))
            .clone()
    }

    /// Lazy claim: unbind whatever kernel driver holds the interface
    /// (ENODATA = none did), then claim it for usbfs.
    fn ensure_claimed(&self, interface: u8) -> Result<(), UsbError> {
        if interface >= 32 {
            // The claim mask covers interfaces 0..=31.
            return Err(UsbError::NotSupported);
        }
        let mut claimed = self.claimed.lock().unwrap();
        if *claimed & (1u32 << interface) != 0 {
            return Ok(());
        }
        let mut unbind = usbfs::UsbfsIoctl {
            ifno: interface as c_int,
            ioctl_code: usbfs::USBDEVFS_DISCONNECT_CODE,
            data: std::ptr::null_mut(),
        };
        // SAFETY: fd is open, the struct lives across the call.
        match unsafe { usbfs::usbdevfs_ioctl(self.raw_fd(), &mut unbind) } {
            Ok(_) => debug!("port {}: unbound kernel driver from {interface}", self.port),
            Err(Errno::ENODATA) => {}
            Err(e) => trace!("port {}: driver unbind: {e}", self.port),
        }
        let ifno = interface as c_uint;
        // SAFETY: as above.
        unsafe { usbfs::usbdevfs_claiminterface(self.raw_fd(), &ifno) }
            .map_err(|e| errno_error("claim interface", e))?;
        *claimed |= 1u32 << interface;
        debug!("port {}: claimed interface {interface}", self.port);
        Ok(())
    }

    /// Data transfers do not name an interface; default to claiming the
    /// first one the device describes.
    fn ensure_any_claim(&self) -> Result<(), UsbError> {
        if *self.claimed.lock().unwrap() != 0 {
            return Ok(());
        }
        let first = self.info.interfaces.first().map_or(0, |i| i.number);
        self.ensure_claimed(first)
    }

    fn release_all(&self) {
        let mut claimed = *self.claimed.lock().unwrap();
        while claimed != 0 {
            let ifno = claimed.trailing_zeros() as c_uint;
            claimed &= claimed - 1;
            // SAFETY: fd is open for the duration of the call.
            let _ = unsafe { usbfs::usbdevfs_releaseinterface(self.raw_fd(), &ifno) };
        }
    }
}

fn errno_error(operation: &'static str, errno: Errno) -> UsbError {
    match errno {
        Errno::ENODEV => UsbError::NoDevice,
        Errno::EPIPE => UsbError::Stall,
        // "nothing ready" / "try again"; the caller's retry loop deals.
        Errno::EAGAIN | Errno::ETIMEDOUT => UsbError::Nak,
        e => UsbError::Transport(TransportError::new(
            operation,
            std::io::Error::from_raw_os_error(e as i32),
        )),
    }
}

/// Status of a reaped URB is a negated errno.
fn urb_status_error(status: i32) -> Option<UsbError> {
    if status == 0 {
        return None;
    }
    Some(errno_error("urb", Errno::from_i32(-status)))
}

struct Shared {
    sysfs_root: PathBuf,
    devfs_root: PathBuf,
    slots: Mutex<Vec<Option<Arc<UsbfsDevice>>>>,
    events: Mutex<Option<SyncSender<PortEvent>>>,
    uevent_fd: Mutex<Option<OwnedFd>>,
    poller: Mutex<Option<Poller>>,
}

impl Shared {
    fn device(&self, port: u8) -> Result<Arc<UsbfsDevice>, UsbError> {
        let slot = (port as usize).checked_sub(1).ok_or(UsbError::NoDevice)?;
        let slots = self.slots.lock().unwrap();
        slots
            .get(slot)
            .and_then(|s| s.clone())
            .filter(|d| !d.disconnected.load(Ordering::Acquire))
            .ok_or(UsbError::NoDevice)
    }

    fn send_event(&self, event: PortEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            if tx.try_send(event).is_err() {
                warn!("event queue stalled, dropping {event:?}");
            }
        }
    }

    /// Open a discovered device and adopt it into the pool.
    fn add_device(&self, info: SysfsDevice) {
        {
            let slots = self.slots.lock().unwrap();
            if slots.iter().flatten().any(|d| {
                d.info.busnum == info.busnum && d.info.devnum == info.devnum
            }) {
                return;
            }
        }
        let path = info.devfs_path(&self.devfs_root);
        let file = match std::fs::File::options().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                trace!("{}: open failed: {e}", path.display());
                return;
            }
        };
        let fd: OwnedFd = file.into();

        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.iter().position(|s| s.is_none()) else {
            warn!("device pool full, ignoring {}", info.name);
            return;
        };
        let port = (slot + 1) as u8;
        let speed = info.speed;
        let device = Arc::new(UsbfsDevice {
            port,
            fd,
            info,
            address: AtomicU8::new(0),
            claimed: Mutex::new(0),
            disconnected: AtomicBool::new(false),
            pools: Mutex::new(HashMap::new()),
        });

        // While a slot holds a connection its descriptor is registered
        // with the poller (usbfs signals completed URBs as writable).
        if let Some(poller) = self.poller.lock().unwrap().as_ref() {
            if let Err(e) = poller.register(
                device.raw_fd(),
                poller::device_token(slot),
                mio::Interest::WRITABLE,
            ) {
                warn!("port {port}: epoll registration failed: {e}");
                return;
            }
        }
        slots[slot] = Some(device.clone());
        drop(slots);

        debug!(
            "port {port}: {} {:04x}:{:04x} at {}",
            device.info.name,
            device.info.vendor_id,
            device.info.product_id,
            path.display()
        );
        self.send_event(PortEvent::Connect { port, speed });
    }

    /// A device is gone (uevent remove or ENODEV): unregister, drop its
    /// slot, fire the disconnect event. URBs in flight die with the fd.
    fn device_gone(&self, port: u8) {
        let removed = {
            let mut slots = self.slots.lock().unwrap();
            let slot = (port as usize).saturating_sub(1);
            slots.get_mut(slot).and_then(|s| s.take())
        };
        let Some(device) = removed else { return };
        device.disconnected.store(true, Ordering::Release);
        if let Some(poller) = self.poller.lock().unwrap().as_ref() {
            let _ = poller.deregister(device.raw_fd());
        }
        device.pools.lock().unwrap().clear();
        debug!("port {port}: gone");
        self.send_event(PortEvent::Disconnect { port });
    }

    fn device_gone_by_ids(&self, busnum: u8, devnum: u8) {
        let port = {
            let slots = self.slots.lock().unwrap();
            slots.iter().flatten().find_map(|d| {
                (d.info.busnum == busnum && d.info.devnum == devnum).then_some(d.port)
            })
        };
        if let Some(port) = port {
            self.device_gone(port);
        }
    }

    fn drain_uevents(&self) {
        let guard = self.uevent_fd.lock().unwrap();
        let Some(fd) = guard.as_ref() else { return };
        let mut buf = [0u8; 4096];
        loop {
            match uevent::recv(fd, &mut buf) {
                Ok(Some(n)) => {
                    let Some(event) = uevent::parse(&buf[..n]) else {
                        continue;
                    };
                    if !event.is_usb_device() {
                        continue;
                    }
                    match event.action {
                        UeventAction::Add => {
                            if let Some(name) = event.sysfs_name() {
                                if let Some(info) =
                                    sysfs::read_device(&self.sysfs_root, name)
                                {
                                    self.add_device(info);
                                }
                            }
                        }
                        UeventAction::Remove => {
                            if let (Some(busnum), Some(devnum)) =
                                (event.busnum, event.devnum)
                            {
                                self.device_gone_by_ids(busnum, devnum);
                            }
                        }
                        _ => {}
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("uevent socket: {e}");
                    return;
                }
            }
        }
    }

    /// Reap completed URBs off a readable device descriptor.
    fn reap_device(&self, slot: usize) {
        let device = {
            let slots = self.slots.lock().unwrap();
            slots.get(slot).and_then(|s| s.clone())
        };
        let Some(device) = device else { return };
        loop {
            let mut urb_ptr: *mut usbfs::Urb = std::ptr::null_mut();
            // SAFETY: fd is open; the kernel hands back a pointer we
            // submitted, whose slot memory is pinned in its pool.
            match unsafe { usbfs::usbdevfs_reapurbndelay(device.raw_fd(), &mut urb_ptr) } {
                Ok(_) => {
                    if urb_ptr.is_null() {
                        continue;
                    }
                    // SAFETY: see above; the URB lives in a boxed slot.
                    let (endpoint, index) = unsafe {
                        ((*urb_ptr).endpoint, (*urb_ptr).usercontext as usize)
                    };
                    let pool = device.pools.lock().unwrap().get(&endpoint).cloned();
                    match pool {
                        Some(pool) => {
                            pool.complete(index);
                        }
                        None => trace!("reaped urb for unknown endpoint {endpoint:#04x}"),
                    }
                }
                Err(Errno::EAGAIN) => return,
                Err(Errno::ENODEV) => {
                    self.device_gone(device.port);
                    return;
                }
                Err(e) => {
                    warn!("port {}: reap: {e}", device.port);
                    return;
                }
            }
        }
    }
}

/// Host-side HAL over `/dev/bus/usb`.
pub struct UsbfsHostHal {
    shared: Arc<Shared>,
}

impl UsbfsHostHal {
    pub fn new() -> Self {
        Self::with_roots(sysfs::SYSFS_USB_DEVICES, sysfs::DEVFS_ROOT)
    }

    /// Alternate filesystem roots, for scans of a staged tree.
    pub fn with_roots(
        sysfs_root: impl Into<PathBuf>,
        devfs_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sysfs_root: sysfs_root.into(),
                devfs_root: devfs_root.into(),
                slots: Mutex::new(vec![None; MAX_DEVICES]),
                events: Mutex::new(None),
                uevent_fd: Mutex::new(None),
                poller: Mutex::new(None),
            }),
        }
    }

    fn timeout_ms(ctx: &Context) -> u32 {
        ctx.remaining()
            .unwrap_or(DEFAULT_TRANSFER_TIMEOUT)
            .as_millis()
            .min(u32::MAX as u128) as u32
    }

    /// The bulk ioctl serves interrupt endpoints too; both run through
    /// here with the caller's timeout.
    fn bulk_ioctl(
        &self,
        ctx: &Context,
        device: &Arc<UsbfsDevice>,
        ep_address: u8,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        device.ensure_any_claim()?;
        let (ptr, len) = match data {
            DataPhase::In(buf) => {
                if wire::endpoint_direction(ep_address) != Direction::In {
                    return Err(UsbError::InvalidEndpoint);
                }
                (buf.as_mut_ptr() as *mut c_void, buf.len())
            }
            DataPhase::Out(buf) => {
                if wire::endpoint_direction(ep_address) != Direction::Out {
                    return Err(UsbError::InvalidEndpoint);
                }
                (buf.as_ptr() as *mut c_void, buf.len())
            }
            DataPhase::None => (std::ptr::null_mut(), 0),
        };
        let mut xfer = usbfs::BulkTransfer {
            ep: ep_address as c_uint,
            len: len as c_uint,
            timeout: Self::timeout_ms(ctx),
            data: ptr,
        };
        // SAFETY: the buffer outlives the synchronous ioctl.
        let result = unsafe { usbfs::usbdevfs_bulk(device.raw_fd(), &mut xfer) };
        match result {
            Ok(n) => Ok(n as usize),
            Err(Errno::ENODEV) => {
                self.shared.device_gone(device.port);
                Err(UsbError::NoDevice)
            }
            Err(e) => Err(errno_error("bulk transfer", e)),
        }
    }
}

impl Default for UsbfsHostHal {
    fn default() -> Self {
        Self::new()
    }
}

impl HostHal for UsbfsHostHal {
    fn init(&self) -> Result<(), UsbError> {
        if !self.shared.sysfs_root.exists() {
            return Err(transport(
                "sysfs scan",
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    self.shared.sysfs_root.display().to_string(),
                ),
            ));
        }
        Ok(())
    }

    fn start(&self, events: SyncSender<PortEvent>) -> Result<(), UsbError> {
        let mut poller_slot = self.shared.poller.lock().unwrap();
        if poller_slot.is_some() {
            return Err(UsbError::AlreadyRunning);
        }
        *self.shared.events.lock().unwrap() = Some(events);

        let uevent_fd = uevent::open_socket().map_err(|e| transport("netlink socket", e))?;
        let uevent_raw = uevent_fd.as_raw_fd();
        *self.shared.uevent_fd.lock().unwrap() = Some(uevent_fd);

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let poller = Poller::spawn(move |token| {
            let Some(shared) = weak.upgrade() else { return };
            if token == UEVENT_TOKEN {
                shared.drain_uevents();
            } else if let Some(slot) = poller::device_slot(token) {
                shared.reap_device(slot);
            }
        })
        .map_err(|e| transport("epoll setup", e))?;
        poller
            .register(uevent_raw, UEVENT_TOKEN, mio::Interest::READABLE)
            .map_err(|e| transport("netlink registration", e))?;
        *poller_slot = Some(poller);
        drop(poller_slot);

        // Initial scan; hotplug keeps it current from here on.
        for info in sysfs::scan(&self.shared.sysfs_root) {
            self.shared.add_device(info);
        }
        Ok(())
    }

    fn stop(&self) {
        if let Some(poller) = self.shared.poller.lock().unwrap().take() {
            poller.shutdown();
        }
        *self.shared.uevent_fd.lock().unwrap() = None;
        *self.shared.events.lock().unwrap() = None;
        let mut slots = self.shared.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if let Some(device) = slot.take() {
                device.disconnected.store(true, Ordering::Release);
                device.release_all();
            }
        }
    }

    /// The kernel reset and enumerated the device when it appeared;
    /// re-issuing a port reset here would tear down the very fd we hold.
    fn reset_port(&self, _ctx: &Context, port: u8) -> Result<(), UsbError> {
        self.shared.device(port).map(|_| ())
    }

    fn assign_address(&self, _ctx: &Context, port: u8, address: u8) -> Result<(), UsbError> {
        let device = self.shared.device(port)?;
        device.address.store(address, Ordering::Release);
        Ok(())
    }

    fn control_transfer(
        &self,
        ctx: &Context,
        port: u8,
        _address: u8,
        setup: SetupPacket,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        let device = self.shared.device(port)?;

        if setup.kind() == RequestKind::Standard {
            match setup.bRequest {
                // Addressing happened in the kernel's enumeration; the
                // host core's assignment is tracked, not re-sent.
                wire::SET_ADDRESS => {
                    device
                        .address
                        .store((setup.wValue & 0x7F) as u8, Ordering::Release);
                    return Ok(0);
                }
                // usbfs requires the dedicated ioctls for configuration
                // and alternate-setting changes.
                wire::SET_CONFIGURATION => {
                    let value = (setup.wValue & 0xFF) as c_uint;
                    // SAFETY: fd open, value on the stack.
                    return match unsafe {
                        usbfs::usbdevfs_setconfiguration(device.raw_fd(), &value)
                    } {
                        Ok(_) => Ok(0),
                        Err(Errno::ENODEV) => {
                            self.shared.device_gone(device.port);
                            Err(UsbError::NoDevice)
                        }
                        Err(e) => Err(errno_error("set configuration", e)),
                    };
                }
                wire::SET_INTERFACE => {
                    let interface = (setup.wIndex & 0xFF) as u8;
                    device.ensure_claimed(interface)?;
                    let request = usbfs::SetInterface {
                        interface: interface as c_uint,
                        altsetting: (setup.wValue & 0xFF) as c_uint,
                    };
                    // SAFETY: fd open, struct on the stack.
                    return match unsafe {
                        usbfs::usbdevfs_setinterface(device.raw_fd(), &request)
                    } {
                        Ok(_) => Ok(0),
                        Err(Errno::ENODEV) => {
                            self.shared.device_gone(device.port);
                            Err(UsbError::NoDevice)
                        }
                        Err(e) => Err(errno_error("set interface", e)),
                    };
                }
                _ => {}
            }
        }
        if setup.recipient() == Recipient::Interface {
            device.ensure_claimed((setup.wIndex & 0xFF) as u8)?;
        }

        let (ptr, len) = match data {
            DataPhase::In(buf) => (buf.as_mut_ptr() as *mut c_void, buf.len()),
            DataPhase::Out(buf) => (buf.as_ptr() as *mut c_void, buf.len()),
            DataPhase::None => (std::ptr::null_mut(), 0),
        };
        let mut xfer = usbfs::CtrlTransfer {
            bRequestType: setup.bmRequestType,
            bRequest: setup.bRequest,
            wValue: setup.wValue,
            wIndex: setup.wIndex,
            wLength: len.min(setup.wLength as usize) as u16,
            timeout: Self::timeout_ms(ctx),
            data: ptr,
        };
        // SAFETY: buffer outlives the synchronous ioctl.
        match unsafe { usbfs::usbdevfs_control(device.raw_fd(), &mut xfer) } {
            Ok(n) => Ok(n as usize),
            Err(Errno::ENODEV) => {
                self.shared.device_gone(device.port);
                Err(UsbError::NoDevice)
            }
            Err(e) => Err(errno_error("control transfer", e)),
        }
    }

    fn bulk_transfer(
        &self,
        ctx: &Context,
        port: u8,
        _address: u8,
        ep_address: u8,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        let device = self.shared.device(port)?;
        self.bulk_ioctl(ctx, &device, ep_address, data)
    }

    /// Interrupt transfers run through the asynchronous URB pool so a
    /// quiet endpoint does not tie down the device descriptor.
    fn interrupt_transfer(
        &self,
        ctx: &Context,
        port: u8,
        _address: u8,
        ep_address: u8,
        mut data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        let device = self.shared.device(port)?;
        device.ensure_any_claim()?;

        let (out_data, length) = match &data {
            DataPhase::In(buf) => (None, buf.len().min(URB_BUFFER_SIZE)),
            DataPhase::Out(buf) => (Some(*buf), buf.len()),
            DataPhase::None => (None, 0),
        };
        let pool = device.pool(ep_address, usbfs::URB_TYPE_INTERRUPT);
        let (index, urb_ptr, completion) = pool.prepare(out_data, length)?;

        // SAFETY: the URB and buffer live in a pinned pool slot that
        // stays allocated until the URB reaps.
        if let Err(e) = unsafe { usbfs::usbdevfs_submiturb(device.raw_fd(), urb_ptr) } {
            pool.free(index);
            if e == Errno::ENODEV {
                self.shared.device_gone(device.port);
                return Err(UsbError::NoDevice);
            }
            return Err(errno_error("submit urb", e));
        }

        loop {
            match completion.recv_timeout(Duration::from_millis(100)) {
                Ok(done) => {
                    if let Some(err) = urb_status_error(done.status) {
                        pool.free(index);
                        if matches!(err, UsbError::NoDevice) {
                            self.shared.device_gone(device.port);
                        }
                        return Err(err);
                    }
                    let n = match &mut data {
                        DataPhase::In(buf) => pool.read_buffer(index, buf),
                        _ => done.actual_length,
                    };
                    pool.free(index);
                    return Ok(n);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if device.disconnected.load(Ordering::Acquire) {
                        pool.abandon(index);
                        return Err(UsbError::NoDevice);
                    }
                    if ctx.is_cancelled() {
                        // SAFETY: the slot is still pinned; a discarded
                        // URB still reaps (with -ENOENT) and frees it.
                        let _ = unsafe {
                            usbfs::usbdevfs_discardurb(device.raw_fd(), urb_ptr)
                        };
                        pool.abandon(index);
                        return Err(UsbError::Cancelled);
                    }
                    // Edge-triggered readiness can race registration;
                    // an opportunistic reap keeps us live.
                    self.shared.reap_device(device.port as usize - 1);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    pool.abandon(index);
                    return Err(UsbError::NoDevice);
                }
            }
        }
    }
}

impl Drop for UsbfsHostHal {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "tests/host.rs"]
mod tests;
