//! The host controller: hotplug demux, enumeration driver, device
//! registry, and typed transfers.

use crate::device::HostDevice;
use crate::enumerate;
use log::{debug, warn};
use softusb_core::context::{CancelHandle, Context};
use softusb_core::error::UsbError;
use softusb_core::host_hal::{DataPhase, HostHal, PortEvent};
use softusb_core::types::UsbSpeed;
use softusb_core::wire::SetupPacket;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Bounded queues between the HAL, the hotplug thread, and waiters.
const EVENT_QUEUE_CAPACITY: usize = 16;

/// How long a NAKed bulk/interrupt transfer backs off before retrying.
const NAK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

type DeviceCallback = Box<dyn Fn(&Arc<HostDevice>) + Send + Sync>;

/// Tunables a caller may override before `start`.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Time allowed for one device's complete enumeration sequence.
    pub enumeration_timeout: Duration,
    /// Default deadline for a transfer whose context has none.
    pub transfer_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            enumeration_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(5),
        }
    }
}

/// Bus addresses 1..=127, smallest-free with a round-robin cursor so a
/// freed address is not immediately handed back out.
struct AddressAllocator {
    used: u128,
    cursor: u8,
}

impl AddressAllocator {
    fn new() -> Self {
        Self {
            used: 1, // address 0 is the enumeration default, never assigned
            cursor: 0,
        }
    }

    fn alloc(&mut self) -> Option<u8> {
        for i in 0..127u16 {
            let candidate = ((self.cursor as u16 + i) % 127 + 1) as u8;
            if self.used & (1u128 << candidate) == 0 {
                self.used |= 1u128 << candidate;
                self.cursor = candidate;
                return Some(candidate);
            }
        }
        None
    }

    fn free(&mut self, address: u8) {
        if address >= 1 {
            self.used &= !(1u128 << address);
        }
    }
}

/// Registry and allocator, guarded by the host-level mutex. Per the
/// locking discipline this lock is always acquired last.
struct HostState {
    devices: Vec<Arc<HostDevice>>,
    allocator: AddressAllocator,
    /// One bit per port (transports number them 1..=31) with a device
    /// present: connected, possibly still enumerating.
    ports: u32,
}

impl HostState {
    fn port_present(&self, port: u8) -> bool {
        self.ports & (1u32 << port) != 0
    }

    fn mark_port(&mut self, port: u8) {
        self.ports |= 1u32 << port;
    }

    fn clear_port(&mut self, port: u8) {
        self.ports &= !(1u32 << port);
    }
}

struct HostShared<H: HostHal> {
    hal: Arc<H>,
    options: HostOptions,
    state: Mutex<HostState>,
    ready: Mutex<Option<SyncSender<Arc<HostDevice>>>>,
    on_connect: Mutex<Option<DeviceCallback>>,
    on_disconnect: Mutex<Option<DeviceCallback>>,
}

/// A USB host bound to one transport.
pub struct Host<H: HostHal + 'static> {
    shared: Arc<HostShared<H>>,
    ready_rx: Mutex<Option<Receiver<Arc<HostDevice>>>>,
    worker: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
}

impl<H: HostHal + 'static> Host<H> {
    pub fn new(hal: Arc<H>) -> Self {
        Self::with_options(hal, HostOptions::default())
    }

    pub fn with_options(hal: Arc<H>, options: HostOptions) -> Self {
        Self {
            shared: Arc::new(HostShared {
                hal,
                options,
                state: Mutex::new(HostState {
                    devices: Vec::new(),
                    allocator: AddressAllocator::new(),
                    ports: 0,
                }),
                ready: Mutex::new(None),
                on_connect: Mutex::new(None),
                on_disconnect: Mutex::new(None),
            }),
            ready_rx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Callback invoked (from the enumeration thread) for every device
    /// that completes enumeration.
    pub fn set_on_device_connect(
        &self,
        cb: impl Fn(&Arc<HostDevice>) + Send + Sync + 'static,
    ) {
        *self.shared.on_connect.lock().unwrap() = Some(Box::new(cb));
    }

    /// Callback invoked (from the hotplug thread) on disconnect.
    pub fn set_on_device_disconnect(
        &self,
        cb: impl Fn(&Arc<HostDevice>) + Send + Sync + 'static,
    ) {
        *self.shared.on_disconnect.lock().unwrap() = Some(Box::new(cb));
    }

    /// Initialize the transport, enable the root hub, and spawn the
    /// hotplug-monitoring thread.
    pub fn start(&self) -> Result<(), UsbError> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Err(UsbError::AlreadyRunning);
        }
        self.shared.hal.init()?;

        let (event_tx, event_rx) = sync_channel::<PortEvent>(EVENT_QUEUE_CAPACITY);
        self.shared.hal.start(event_tx)?;

        let (ready_tx, ready_rx) = sync_channel(EVENT_QUEUE_CAPACITY);
        *self.shared.ready.lock().unwrap() = Some(ready_tx);
        *self.ready_rx.lock().unwrap() = Some(ready_rx);

        let (ctx, cancel) = Context::with_cancel();
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("softusb-hotplug".into())
            .spawn(move || HostShared::hotplug_loop(&shared, &ctx, event_rx))
            .map_err(|e| softusb_core::error::transport("spawn hotplug thread", e))?;
        *worker = Some((cancel, handle));
        Ok(())
    }

    /// Stop the hotplug thread and the transport; outstanding records
    /// are marked detached.
    pub fn stop(&self) -> Result<(), UsbError> {
        let Some((cancel, handle)) = self.worker.lock().unwrap().take() else {
            return Err(UsbError::NotRunning);
        };
        cancel.cancel();
        self.shared.hal.stop();
        let _ = handle.join();

        *self.shared.ready.lock().unwrap() = None;
        let drained: Vec<_> = {
            let mut state = self.shared.state.lock().unwrap();
            state.ports = 0;
            state.devices.drain(..).collect()
        };
        for device in drained {
            device.mark_detached();
        }
        Ok(())
    }

    /// Block for the next fully enumerated device.
    pub fn wait_device(&self, ctx: &Context) -> Result<Arc<HostDevice>, UsbError> {
        let rx_guard = self.ready_rx.lock().unwrap();
        let Some(rx) = rx_guard.as_ref() else {
            return Err(UsbError::NotRunning);
        };
        loop {
            ctx.check()?;
            let step = ctx
                .remaining()
                .map_or(Duration::from_millis(100), |r| {
                    r.min(Duration::from_millis(100))
                });
            match rx.recv_timeout(step) {
                Ok(device) => return Ok(device),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(UsbError::NotRunning),
            }
        }
    }

    /// Snapshot of currently connected, enumerated devices.
    pub fn devices(&self) -> Vec<Arc<HostDevice>> {
        self.shared.state.lock().unwrap().devices.clone()
    }

    /// A control transfer on the device's default pipe. Returns
    /// data-phase bytes transferred.
    pub fn control_transfer(
        &self,
        ctx: &Context,
        device: &HostDevice,
        setup: SetupPacket,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        if device.is_gone() {
            return Err(UsbError::NoDevice);
        }
        let ctx = self.bounded(ctx);
        self.shared
            .hal
            .control_transfer(&ctx, device.port, device.address, setup, data)
    }

    /// A bulk transfer. NAKs are retried until the context deadline;
    /// stalls surface immediately.
    pub fn bulk_transfer(
        &self,
        ctx: &Context,
        device: &HostDevice,
        ep_address: u8,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        self.data_transfer(ctx, device, ep_address, data, false)
    }

    /// An interrupt transfer, with the same NAK-retry policy as bulk.
    pub fn interrupt_transfer(
        &self,
        ctx: &Context,
        device: &HostDevice,
        ep_address: u8,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        self.data_transfer(ctx, device, ep_address, data, true)
    }

    fn data_transfer(
        &self,
        ctx: &Context,
        device: &HostDevice,
        ep_address: u8,
        mut data: DataPhase<'_>,
        interrupt: bool,
    ) -> Result<usize, UsbError> {
        if device.is_gone() {
            return Err(UsbError::NoDevice);
        }
        let ctx = self.bounded(ctx);
        loop {
            let phase = match &mut data {
                DataPhase::In(buf) => DataPhase::In(&mut **buf),
                DataPhase::Out(buf) => DataPhase::Out(*buf),
                DataPhase::None => DataPhase::None,
            };
            let result = if interrupt {
                self.shared.hal.interrupt_transfer(
                    &ctx,
                    device.port,
                    device.address,
                    ep_address,
                    phase,
                )
            } else {
                self.shared
                    .hal
                    .bulk_transfer(&ctx, device.port, device.address, ep_address, phase)
            };
            match result {
                Err(UsbError::Nak) => {
                    if device.is_gone() {
                        return Err(UsbError::NoDevice);
                    }
                    ctx.check()?;
                    std::thread::sleep(NAK_RETRY_INTERVAL);
                }
                other => return other,
            }
        }
    }

    /// Apply the default transfer timeout to deadline-less contexts.
    fn bounded(&self, ctx: &Context) -> Context {
        if ctx.deadline().is_some() {
            ctx.clone()
        } else {
            ctx.child_timeout(self.shared.options.transfer_timeout)
        }
    }
}

impl<H: HostHal + 'static> Drop for Host<H> {
    fn drop(&mut self) {
        if self.worker.lock().unwrap().is_some() {
            let _ = self.stop();
        }
    }
}

impl<H: HostHal + 'static> HostShared<H> {
    fn hotplug_loop(shared: &Arc<Self>, ctx: &Context, events: Receiver<PortEvent>) {
        loop {
            if ctx.is_cancelled() {
                return;
            }
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(PortEvent::Connect { port, speed }) => {
                    Self::on_port_connect(shared, ctx, port, speed)
                }
                Ok(PortEvent::Disconnect { port }) => shared.on_port_disconnect(port),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn on_port_connect(shared: &Arc<Self>, ctx: &Context, port: u8, speed: UsbSpeed) {
        if port == 0 || port >= 32 {
            warn!("transport reported out-of-range port {port}");
            return;
        }
        {
            let mut state = shared.state.lock().unwrap();
            if state.port_present(port) {
                return;
            }
            state.mark_port(port);
        }
        debug!("port {port}: connect, {speed:?}");
        let worker = shared.clone();
        let worker_ctx = ctx.clone();
        // Enumerations of different devices proceed concurrently; each
        // connect gets its own worker.
        let spawned = std::thread::Builder::new()
            .name(format!("softusb-enum-{port}"))
            .spawn(move || worker.run_enumeration(&worker_ctx, port, speed));
        if let Err(e) = spawned {
            warn!("port {port}: cannot spawn enumeration: {e}");
            shared.state.lock().unwrap().clear_port(port);
        }
    }

    fn run_enumeration(&self, ctx: &Context, port: u8, speed: UsbSpeed) {
        let ctx = ctx.child_timeout(self.options.enumeration_timeout);

        let max_packet = match enumerate::reset_and_probe(&*self.hal, &ctx, port) {
            Ok(n) => n,
            Err(e) => {
                warn!("port {port}: probe failed: {e}");
                self.state.lock().unwrap().clear_port(port);
                return;
            }
        };

        let address = {
            let mut state = self.state.lock().unwrap();
            state.allocator.alloc()
        };
        let Some(address) = address else {
            warn!("port {port}: no free addresses");
            self.state.lock().unwrap().clear_port(port);
            return;
        };

        let aborted = || !self.state.lock().unwrap().port_present(port);
        match enumerate::enumerate_at(
            &*self.hal,
            &ctx,
            port,
            speed,
            address,
            max_packet,
            &aborted,
        ) {
            Ok(device) => {
                let device = Arc::new(device);
                {
                    let mut state = self.state.lock().unwrap();
                    if !state.port_present(port) {
                        // Disconnected while we were finishing up.
                        state.allocator.free(address);
                        return;
                    }
                    state.devices.push(device.clone());
                }
                if let Some(cb) = self.on_connect.lock().unwrap().as_ref() {
                    cb(&device);
                }
                if let Some(tx) = self.ready.lock().unwrap().as_ref() {
                    match tx.try_send(device) {
                        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("port {port}: ready queue full, device not queued")
                        }
                    }
                }
            }
            Err(e) => {
                warn!("port {port}: enumeration failed: {e}");
                let mut state = self.state.lock().unwrap();
                state.allocator.free(address);
                state.clear_port(port);
            }
        }
    }

    fn on_port_disconnect(&self, port: u8) {
        if port == 0 || port >= 32 {
            return;
        }
        debug!("port {port}: disconnect");
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.clear_port(port);
            let index = state.devices.iter().position(|d| d.port == port);
            index.map(|i| {
                let device = state.devices.remove(i);
                state.allocator.free(device.address);
                device
            })
        };
        if let Some(device) = removed {
            device.mark_detached();
            if let Some(cb) = self.on_disconnect.lock().unwrap().as_ref() {
                cb(&device);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/host.rs"]
mod tests;
