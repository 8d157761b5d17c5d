//! Device-side pipe transport.

use crate::message::{MessageType, MAX_PAYLOAD};
use crate::pipes;
use log::{debug, trace, warn};
use softusb_core::context::Context;
use softusb_core::device_hal::{DeviceHal, Ep0Event};
use softusb_core::error::{transport, UsbError};
use softusb_core::types::{Direction, UsbSpeed};
use softusb_core::wire::{self, SetupPacket};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// How long a response write may wait on a full pipe.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct Pipes {
    connection: Arc<File>,
    host_to_device: Arc<File>,
    device_to_host: Arc<File>,
    // Created with the rest of the directory; reserved for out-of-band
    // interrupt signalling.
    _interrupts: Arc<File>,
    ep_in: [Option<Arc<File>>; 16],
    ep_out: [Option<Arc<File>>; 16],
}

/// The device side of the pipe bus.
///
/// `init` creates (or recreates) the `device-<uuid>` directory with its
/// full set of FIFOs; `connect` writes the `0x01` connection byte the
/// host's bus scan is waiting for; `disconnect` writes `0x00` and
/// removes the directory.
pub struct FifoDeviceHal {
    device_dir: PathBuf,
    uuid: Uuid,
    pipes: RwLock<Option<Pipes>>,
    /// SETUP address filter; 0 accepts everything (pre-address).
    filter: AtomicU8,
    ep0_scratch: Mutex<Box<[u8]>>,
}

impl FifoDeviceHal {
    pub fn new(bus_dir: impl AsRef<Path>) -> Self {
        let uuid = Uuid::new_v4();
        Self {
            device_dir: bus_dir.as_ref().join(format!("device-{uuid}")),
            uuid,
            pipes: RwLock::new(None),
            filter: AtomicU8::new(0),
            ep0_scratch: Mutex::new(vec![0u8; MAX_PAYLOAD].into_boxed_slice()),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    fn host_to_device(&self) -> Result<Arc<File>, UsbError> {
        self.pipes
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.host_to_device.clone())
            .ok_or(UsbError::NotRunning)
    }

    fn device_to_host(&self) -> Result<Arc<File>, UsbError> {
        self.pipes
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.device_to_host.clone())
            .ok_or(UsbError::NotRunning)
    }

    fn endpoint_file(&self, ep_address: u8) -> Result<Arc<File>, UsbError> {
        let number = wire::endpoint_number(ep_address) as usize;
        if number == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        let pipes = self.pipes.read().unwrap();
        let pipes = pipes.as_ref().ok_or(UsbError::NotRunning)?;
        let slot = match wire::endpoint_direction(ep_address) {
            Direction::In => &pipes.ep_in[number],
            Direction::Out => &pipes.ep_out[number],
        };
        slot.clone().ok_or(UsbError::InvalidEndpoint)
    }

    fn write_connection_byte(&self, byte: u8) -> Result<(), UsbError> {
        let connection = self
            .pipes
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.connection.clone())
            .ok_or(UsbError::NotRunning)?;
        (&*connection)
            .write_all(&[byte])
            .map_err(|e| transport("connection write", e))
    }
}

impl DeviceHal for FifoDeviceHal {
    fn init(&self) -> Result<(), UsbError> {
        if let Some(parent) = self.device_dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| transport("create bus dir", e))?;
        }
        // The directory is recreated from scratch on every start.
        let _ = std::fs::remove_dir_all(&self.device_dir);
        std::fs::create_dir(&self.device_dir)
            .map_err(|e| transport("create device dir", e))?;

        for name in ["connection", "host_to_device", "device_to_host", "interrupts"] {
            pipes::create_fifo(&self.device_dir.join(name))?;
        }
        let mut ep_in: [Option<Arc<File>>; 16] = Default::default();
        let mut ep_out: [Option<Arc<File>>; 16] = Default::default();
        for n in 1..=15u8 {
            let in_path = self.device_dir.join(format!("ep{n}_in"));
            let out_path = self.device_dir.join(format!("ep{n}_out"));
            pipes::create_fifo(&in_path)?;
            pipes::create_fifo(&out_path)?;
            ep_in[n as usize] = Some(pipes::open_fifo(&in_path)?);
            ep_out[n as usize] = Some(pipes::open_fifo(&out_path)?);
        }

        let assembled = Pipes {
            connection: pipes::open_fifo(&self.device_dir.join("connection"))?,
            host_to_device: pipes::open_fifo(&self.device_dir.join("host_to_device"))?,
            device_to_host: pipes::open_fifo(&self.device_dir.join("device_to_host"))?,
            _interrupts: pipes::open_fifo(&self.device_dir.join("interrupts"))?,
            ep_in,
            ep_out,
        };
        *self.pipes.write().unwrap() = Some(assembled);
        self.filter.store(0, Ordering::Release);
        debug!("device bus directory ready: {}", self.device_dir.display());
        Ok(())
    }

    fn connect(&self) -> Result<(), UsbError> {
        self.write_connection_byte(0x01)
    }

    fn disconnect(&self) -> Result<(), UsbError> {
        let result = self.write_connection_byte(0x00);
        *self.pipes.write().unwrap() = None;
        let _ = std::fs::remove_dir_all(&self.device_dir);
        result
    }

    fn speed(&self) -> UsbSpeed {
        // The pipe bus does not negotiate; it models a full-speed link.
        UsbSpeed::Full12
    }

    fn read_ep0(&self, ctx: &Context) -> Result<Ep0Event, UsbError> {
        let host_to_device = self.host_to_device()?;
        let device_to_host = self.device_to_host()?;
        let mut scratch = self.ep0_scratch.lock().unwrap();
        loop {
            let (message_type, length) =
                pipes::read_message(&host_to_device, ctx, &mut scratch)?;
            match message_type {
                MessageType::Setup => {
                    if length < 1 + SetupPacket::SIZE {
                        return Err(UsbError::Protocol);
                    }
                    let address = scratch[0];
                    let filter = self.filter.load(Ordering::Acquire);
                    if filter != 0 && address != filter {
                        trace!("SETUP for address {address} ignored (we are {filter})");
                        continue;
                    }
                    let (setup, _) = SetupPacket::parse(&scratch[1..9])?;
                    let out_data = if length > 9 {
                        Some(scratch[9..length].to_vec())
                    } else {
                        None
                    };
                    return Ok(Ep0Event::Setup(setup, out_data));
                }
                MessageType::Reset => {
                    let ctx = Context::with_timeout(WRITE_TIMEOUT);
                    pipes::write_message(&device_to_host, &ctx, MessageType::Ack, &[])?;
                    return Ok(Ep0Event::Reset);
                }
                MessageType::Address => {
                    if length < 1 {
                        return Err(UsbError::Protocol);
                    }
                    self.filter.store(scratch[0], Ordering::Release);
                    let ctx = Context::with_timeout(WRITE_TIMEOUT);
                    pipes::write_message(&device_to_host, &ctx, MessageType::Ack, &[])?;
                    trace!("address filter set to {}", scratch[0]);
                }
                other => {
                    warn!("unexpected {other:?} on control pipe");
                }
            }
        }
    }

    fn write_ep0(&self, data: &[u8]) -> Result<(), UsbError> {
        let ctx = Context::with_timeout(WRITE_TIMEOUT);
        let device_to_host = self.device_to_host()?;
        pipes::write_message(&device_to_host, &ctx, MessageType::Data, &[data])
    }

    fn ack_ep0(&self) -> Result<(), UsbError> {
        let ctx = Context::with_timeout(WRITE_TIMEOUT);
        let device_to_host = self.device_to_host()?;
        pipes::write_message(&device_to_host, &ctx, MessageType::Ack, &[])
    }

    fn stall_ep0(&self) -> Result<(), UsbError> {
        let ctx = Context::with_timeout(WRITE_TIMEOUT);
        let device_to_host = self.device_to_host()?;
        pipes::write_message(&device_to_host, &ctx, MessageType::Stall, &[])
    }

    fn set_address(&self, address: u8) {
        self.filter.store(address, Ordering::Release);
    }

    fn read_endpoint(
        &self,
        ctx: &Context,
        ep_address: u8,
        buf: &mut [u8],
    ) -> Result<usize, UsbError> {
        if wire::endpoint_direction(ep_address) != Direction::Out {
            return Err(UsbError::InvalidEndpoint);
        }
        let file = self.endpoint_file(ep_address)?;
        let mut scratch = [0u8; MAX_PAYLOAD];
        let (message_type, length) = pipes::read_message(&file, ctx, &mut scratch)?;
        if message_type != MessageType::Data {
            return Err(UsbError::Protocol);
        }
        let n = length.min(buf.len());
        buf[..n].copy_from_slice(&scratch[..n]);
        Ok(n)
    }

    fn try_read_endpoint(&self, ep_address: u8, buf: &mut [u8]) -> Result<usize, UsbError> {
        if wire::endpoint_direction(ep_address) != Direction::Out {
            return Err(UsbError::InvalidEndpoint);
        }
        let file = self.endpoint_file(ep_address)?;
        let mut scratch = [0u8; MAX_PAYLOAD];
        match pipes::try_read_message(&file, &mut scratch)? {
            None => Err(UsbError::Nak),
            Some((MessageType::Data, length)) => {
                let n = length.min(buf.len());
                buf[..n].copy_from_slice(&scratch[..n]);
                Ok(n)
            }
            Some(_) => Err(UsbError::Protocol),
        }
    }

    fn write_endpoint(
        &self,
        ctx: &Context,
        ep_address: u8,
        data: &[u8],
    ) -> Result<(), UsbError> {
        if wire::endpoint_direction(ep_address) != Direction::In {
            return Err(UsbError::InvalidEndpoint);
        }
        let file = self.endpoint_file(ep_address)?;
        pipes::write_message(&file, ctx, MessageType::Data, &[data])
    }
}

impl Drop for FifoDeviceHal {
    fn drop(&mut self) {
        if self.pipes.read().unwrap().is_some() {
            let _ = self.disconnect();
        }
    }
}
