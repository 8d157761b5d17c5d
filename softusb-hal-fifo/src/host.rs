//! Host-side pipe transport: bus-directory scanning, port bookkeeping,
//! and transfer framing.

use crate::message::{MessageType, MAX_PAYLOAD};
use crate::pipes;
use log::{debug, trace, warn};
use softusb_core::context::{CancelHandle, Context};
use softusb_core::error::{transport, UsbError};
use softusb_core::host_hal::{DataPhase, HostHal, PortEvent};
use softusb_core::types::{Direction, UsbSpeed};
use softusb_core::wire::{self, SetupPacket};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the bus directory is polled for arrivals.
const SCAN_INTERVAL: Duration = Duration::from_millis(50);

/// How often a device's `connection` FIFO is polled for departure.
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline for the device's answer to a control-pipe message.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Virtual root-hub width: ports 1..=16.
const MAX_PORTS: u8 = 16;

struct FifoPort {
    port: u8,
    dir: PathBuf,
    connection: Arc<File>,
    host_to_device: Arc<File>,
    device_to_host: Arc<File>,
    /// Data-endpoint FIFOs, opened on first use, keyed by endpoint
    /// address.
    endpoints: Mutex<HashMap<u8, Arc<File>>>,
    /// Serializes control-pipe exchanges and owns their scratch buffer.
    control: Mutex<Box<[u8]>>,
}

impl FifoPort {
    fn endpoint_file(&self, ep_address: u8) -> Result<Arc<File>, UsbError> {
        let number = wire::endpoint_number(ep_address);
        if number == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(file) = endpoints.get(&ep_address) {
            return Ok(file.clone());
        }
        let suffix = match wire::endpoint_direction(ep_address) {
            Direction::In => "in",
            Direction::Out => "out",
        };
        let file = pipes::open_fifo(&self.dir.join(format!("ep{number}_{suffix}")))?;
        endpoints.insert(ep_address, file.clone());
        Ok(file)
    }

    /// One control-pipe request/response exchange under the control
    /// lock.
    fn control_exchange(
        &self,
        ctx: &Context,
        message_type: MessageType,
        payload: &[&[u8]],
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        let mut scratch = self.control.lock().unwrap();
        // An exchange abandoned at its deadline can leave a late reply
        // queued; it belongs to no one now.
        while let Ok(Some((stale, _))) =
            pipes::try_read_message(&self.device_to_host, &mut scratch)
        {
            trace!("discarding stale {stale:?} on control pipe");
        }
        pipes::write_message(&self.host_to_device, ctx, message_type, payload)?;
        let response_ctx = ctx.child_timeout(RESPONSE_TIMEOUT);
        let (reply, length) =
            pipes::read_message(&self.device_to_host, &response_ctx, &mut scratch)?;
        match reply {
            MessageType::Data => match data {
                DataPhase::In(buf) => {
                    let n = length.min(buf.len());
                    buf[..n].copy_from_slice(&scratch[..n]);
                    Ok(n)
                }
                _ => Err(UsbError::Protocol),
            },
            MessageType::Ack => Ok(0),
            MessageType::Stall => Err(UsbError::Stall),
            MessageType::Nak => Err(UsbError::Nak),
            // RESET only travels host to device, and the control lock
            // serializes exchanges on this pipe; any other reply is a
            // framing violation by the peer.
            _ => Err(UsbError::Protocol),
        }
    }
}

struct PortTable {
    /// Free-list of port numbers: bit `n` set means port `n + 1` is
    /// taken.
    allocated: u32,
    devices: HashMap<u8, Arc<FifoPort>>,
    /// Directory name -> port, for dirs we have already adopted.
    known: HashMap<String, u8>,
}

impl PortTable {
    fn take_port(&mut self) -> Option<u8> {
        let slot = self.allocated.trailing_ones() as u8;
        if slot >= MAX_PORTS {
            return None;
        }
        self.allocated |= 1u32 << slot;
        Some(slot + 1)
    }

    fn release_port(&mut self, port: u8) {
        self.allocated &= !(1u32 << (port - 1));
    }
}

struct Shared {
    bus_dir: PathBuf,
    table: Mutex<PortTable>,
    events: Mutex<Option<SyncSender<PortEvent>>>,
}

impl Shared {
    fn port(&self, port: u8) -> Result<Arc<FifoPort>, UsbError> {
        self.table
            .lock()
            .unwrap()
            .devices
            .get(&port)
            .cloned()
            .ok_or(UsbError::NoDevice)
    }

    /// Adopt a new `device-*` directory: wait for its `0x01` connection
    /// byte, allocate a port, open the control pipes.
    fn adopt(&self, name: &str) {
        let dir = self.bus_dir.join(name);
        let Ok(connection) = pipes::open_fifo(&dir.join("connection")) else {
            return; // not fully created yet; next scan retries
        };
        let mut byte = [0u8; 1];
        match (&*connection).read(&mut byte) {
            Ok(1) if byte[0] == 0x01 => {}
            _ => return,
        }

        let Ok(host_to_device) = pipes::open_fifo(&dir.join("host_to_device")) else {
            return;
        };
        let Ok(device_to_host) = pipes::open_fifo(&dir.join("device_to_host")) else {
            return;
        };

        let mut table = self.table.lock().unwrap();
        let Some(port) = table.take_port() else {
            warn!("no free ports for {name}");
            return;
        };
        let record = Arc::new(FifoPort {
            port,
            dir,
            connection,
            host_to_device,
            device_to_host,
            endpoints: Mutex::new(HashMap::new()),
            control: Mutex::new(vec![0u8; MAX_PAYLOAD].into_boxed_slice()),
        });
        table.devices.insert(port, record);
        table.known.insert(name.to_owned(), port);
        drop(table);

        debug!("{name}: connected as port {port}");
        self.send_event(PortEvent::Connect {
            port,
            speed: UsbSpeed::Full12,
        });
    }

    fn drop_port(&self, port: u8) {
        let mut table = self.table.lock().unwrap();
        if table.devices.remove(&port).is_none() {
            return;
        }
        table.known.retain(|_, p| *p != port);
        table.release_port(port);
        drop(table);
        debug!("port {port}: disconnected");
        self.send_event(PortEvent::Disconnect { port });
    }

    fn send_event(&self, event: PortEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            if tx.try_send(event).is_err() {
                warn!("event queue stalled, dropping {event:?}");
            }
        }
    }

    /// One pass of the bus scan: adopt arrivals, notice removals.
    fn scan_once(&self) {
        let entries = match std::fs::read_dir(&self.bus_dir) {
            Ok(entries) => entries,
            Err(e) => {
                trace!("bus dir unreadable: {e}");
                return;
            }
        };
        let mut present = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("device-") {
                present.push(name.to_owned());
            }
        }

        let adopt: Vec<String> = {
            let table = self.table.lock().unwrap();
            present
                .iter()
                .filter(|n| !table.known.contains_key(*n))
                .cloned()
                .collect()
        };
        for name in adopt {
            self.adopt(&name);
        }

        // A vanished directory is the bus-side signal that the owner is
        // gone, whatever happened to its connection byte.
        let vanished: Vec<u8> = {
            let table = self.table.lock().unwrap();
            table
                .known
                .iter()
                .filter(|(name, _)| !present.contains(name))
                .map(|(_, port)| *port)
                .collect()
        };
        for port in vanished {
            self.drop_port(port);
        }
    }

    /// Per-device watcher: reads the `connection` FIFO until the device
    /// announces departure (or its directory disappears).
    fn watch_connection(&self, ctx: &Context, port: u8) {
        loop {
            if ctx.is_cancelled() {
                return;
            }
            let Ok(record) = self.port(port) else {
                return; // dropped elsewhere
            };
            if !record.dir.exists() {
                self.drop_port(port);
                return;
            }
            let mut byte = [0u8; 1];
            match (&*record.connection).read(&mut byte) {
                Ok(1) if byte[0] == 0x00 => {
                    self.drop_port(port);
                    return;
                }
                Ok(0) => {
                    // EOF: the peer has exited without the goodbye byte.
                    self.drop_port(port);
                    return;
                }
                _ => {}
            }
            std::thread::sleep(CONNECTION_POLL_INTERVAL);
        }
    }
}

/// The host side of the pipe bus.
pub struct FifoHostHal {
    shared: Arc<Shared>,
    worker: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
    watchers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FifoHostHal {
    pub fn new(bus_dir: impl AsRef<Path>) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus_dir: bus_dir.as_ref().to_path_buf(),
                table: Mutex::new(PortTable {
                    allocated: 0,
                    devices: HashMap::new(),
                    known: HashMap::new(),
                }),
                events: Mutex::new(None),
            }),
            worker: Mutex::new(None),
            watchers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn bus_dir(&self) -> &Path {
        &self.shared.bus_dir
    }
}

impl HostHal for FifoHostHal {
    fn init(&self) -> Result<(), UsbError> {
        std::fs::create_dir_all(&self.shared.bus_dir)
            .map_err(|e| transport("create bus dir", e))
    }

    fn start(&self, events: SyncSender<PortEvent>) -> Result<(), UsbError> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Err(UsbError::AlreadyRunning);
        }
        *self.shared.events.lock().unwrap() = Some(events);

        let (ctx, cancel) = Context::with_cancel();
        let shared = self.shared.clone();
        let watcher_list = self.watchers.clone();
        let handle = std::thread::Builder::new()
            .name("softusb-fifo-scan".into())
            .spawn(move || {
                let mut watched: Vec<u8> = Vec::new();
                loop {
                    if ctx.is_cancelled() {
                        return;
                    }
                    shared.scan_once();
                    // Spawn a connection watcher for every port we have
                    // not covered yet.
                    let ports: Vec<u8> = {
                        let table = shared.table.lock().unwrap();
                        table.devices.keys().copied().collect()
                    };
                    for port in ports {
                        if !watched.contains(&port) {
                            watched.push(port);
                            let shared = shared.clone();
                            let ctx = ctx.clone();
                            if let Ok(h) = std::thread::Builder::new()
                                .name(format!("softusb-fifo-conn-{port}"))
                                .spawn(move || shared.watch_connection(&ctx, port))
                            {
                                watcher_list.lock().unwrap().push(h);
                            }
                        }
                    }
                    watched.retain(|p| {
                        shared.table.lock().unwrap().devices.contains_key(p)
                    });
                    std::thread::sleep(SCAN_INTERVAL);
                }
            })
            .map_err(|e| transport("spawn bus scan", e))?;
        *worker = Some((cancel, handle));
        Ok(())
    }

    fn stop(&self) {
        if let Some((cancel, handle)) = self.worker.lock().unwrap().take() {
            cancel.cancel();
            let _ = handle.join();
        }
        for handle in self.watchers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        *self.shared.events.lock().unwrap() = None;
        let mut table = self.shared.table.lock().unwrap();
        table.devices.clear();
        table.known.clear();
        table.allocated = 0;
    }

    fn reset_port(&self, ctx: &Context, port: u8) -> Result<(), UsbError> {
        let record = self.shared.port(port)?;
        record
            .control_exchange(ctx, MessageType::Reset, &[], DataPhase::None)
            .map(|_| ())
    }

    fn assign_address(&self, ctx: &Context, port: u8, address: u8) -> Result<(), UsbError> {
        let record = self.shared.port(port)?;
        record
            .control_exchange(ctx, MessageType::Address, &[&[address]], DataPhase::None)
            .map(|_| ())
    }

    fn control_transfer(
        &self,
        ctx: &Context,
        port: u8,
        address: u8,
        setup: SetupPacket,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        let record = self.shared.port(port)?;
        let mut setup_bytes = [0u8; SetupPacket::SIZE];
        setup.write_to(&mut setup_bytes);
        let address_byte = [address];
        match data {
            DataPhase::Out(out) => record.control_exchange(
                ctx,
                MessageType::Setup,
                &[&address_byte, &setup_bytes, out],
                DataPhase::None,
            ),
            data => record.control_exchange(
                ctx,
                MessageType::Setup,
                &[&address_byte, &setup_bytes],
                data,
            ),
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
        let record = self.shared.port(port)?;
        let file = record.endpoint_file(ep_address)?;
        match data {
            DataPhase::Out(out) => {
                if wire::endpoint_direction(ep_address) != Direction::Out {
                    return Err(UsbError::InvalidEndpoint);
                }
                pipes::write_message(&file, ctx, MessageType::Data, &[out])?;
                Ok(out.len())
            }
            DataPhase::In(buf) => {
                if wire::endpoint_direction(ep_address) != Direction::In {
                    return Err(UsbError::InvalidEndpoint);
                }
                let mut scratch = [0u8; MAX_PAYLOAD];
                // One short poll: nothing waiting reads as a NAK, which
                // the host core retries against its own deadline.
                let poll_ctx = ctx.child_timeout(Duration::from_millis(100));
                match pipes::read_message(&file, &poll_ctx, &mut scratch) {
                    Ok((MessageType::Data, length)) => {
                        let n = length.min(buf.len());
                        buf[..n].copy_from_slice(&scratch[..n]);
                        Ok(n)
                    }
                    Ok((MessageType::Stall, _)) => Err(UsbError::Stall),
                    Ok(_) => Err(UsbError::Protocol),
                    Err(UsbError::Cancelled) if !ctx.is_cancelled() => Err(UsbError::Nak),
                    Err(e) => Err(e),
                }
            }
            DataPhase::None => Ok(0),
        }
    }

    fn interrupt_transfer(
        &self,
        ctx: &Context,
        port: u8,
        address: u8,
        ep_address: u8,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError> {
        // Same framed DATA exchange as bulk; the pipes do not model the
        // polling cadence.
        self.bulk_transfer(ctx, port, address, ep_address, data)
    }
}

impl Drop for FifoHostHal {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "tests/host.rs"]
mod tests;
