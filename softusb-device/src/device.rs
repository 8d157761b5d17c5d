//! The device core: state machine, standard-request execution, and
//! class-request routing.

use crate::class::{ClassDriver, InterfaceContext, SetupReply};
use crate::descriptors::DescriptorTree;
use crate::endpoint::EndpointHandle;
use log::{debug, trace, warn};
use softusb_core::context::{CancelHandle, Context};
use softusb_core::device_hal::{DeviceHal, Ep0Event};
use softusb_core::error::UsbError;
use softusb_core::types::{DeviceState, EndpointType, UsbSpeed};
use softusb_core::wire::{self, Recipient, RequestKind, SetupPacket};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// One fixed response buffer per device; EP0 servicing is sequential so
/// it is never reused before the HAL has consumed the previous reply.
const EP0_RESPONSE_CAPACITY: usize = 512;

struct Runtime {
    state: DeviceState,
    address: u8,
    /// Active configuration value, 0 when addressed but not configured.
    configuration: u8,
    remote_wakeup_enabled: bool,
    /// Selected alternate setting per interface number.
    alternates: HashMap<u8, u8>,
    /// Endpoint handles of the active configuration, by address.
    endpoints: HashMap<u8, EndpointHandle>,
}

impl Runtime {
    fn new() -> Self {
        Self {
            state: DeviceState::Detached,
            address: 0,
            configuration: 0,
            remote_wakeup_enabled: false,
            alternates: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }
}

struct Shared<H: DeviceHal> {
    hal: Arc<H>,
    tree: DescriptorTree,
    drivers: Mutex<HashMap<(u8, u8), Arc<dyn ClassDriver>>>,
    runtime: RwLock<Runtime>,
}

/// A running (or runnable) USB device.
///
/// Built from a frozen [`DescriptorTree`] and a transport; `start`
/// spawns the control-endpoint servicing thread.
pub struct Device<H: DeviceHal + 'static> {
    shared: Arc<Shared<H>>,
    worker: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
}

impl<H: DeviceHal + 'static> Device<H> {
    pub fn new(hal: Arc<H>, tree: DescriptorTree) -> Self {
        Self {
            shared: Arc::new(Shared {
                hal,
                tree,
                drivers: Mutex::new(HashMap::new()),
                runtime: RwLock::new(Runtime::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Bind a class driver to (configuration value, interface number).
    ///
    /// A driver may be bound to several interfaces. Binding is only
    /// allowed before `start`.
    pub fn bind_class_driver(
        &self,
        configuration_value: u8,
        interface_number: u8,
        driver: Arc<dyn ClassDriver>,
    ) -> Result<(), UsbError> {
        if self.worker.lock().unwrap().is_some() {
            return Err(UsbError::AlreadyRunning);
        }
        if self
            .shared
            .tree
            .interface(configuration_value, interface_number, 0)
            .is_none()
        {
            return Err(UsbError::InvalidDescriptor);
        }
        self.shared
            .drivers
            .lock()
            .unwrap()
            .insert((configuration_value, interface_number), driver);
        Ok(())
    }

    /// Initialize the transport, signal attachment, and spawn the
    /// control-endpoint servicing thread.
    pub fn start(&self) -> Result<(), UsbError> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Err(UsbError::AlreadyRunning);
        }
        self.shared.hal.init()?;
        self.shared.hal.connect()?;
        self.shared.runtime.write().unwrap().state = DeviceState::Attached;

        let (ctx, cancel) = Context::with_cancel();
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("softusb-ep0".into())
            .spawn(move || shared.serve_ep0(&ctx))
            .map_err(|e| softusb_core::error::transport("spawn ep0 thread", e))?;
        *worker = Some((cancel, handle));
        Ok(())
    }

    /// Stop the servicing thread, close class drivers, and detach.
    pub fn stop(&self) -> Result<(), UsbError> {
        let Some((cancel, handle)) = self.worker.lock().unwrap().take() else {
            return Err(UsbError::NotRunning);
        };
        cancel.cancel();
        let _ = handle.join();

        // A driver bound to several interfaces is closed once.
        let drivers = self.shared.drivers.lock().unwrap();
        let mut closed: Vec<&Arc<dyn ClassDriver>> = Vec::new();
        for driver in drivers.values() {
            if !closed.iter().any(|c| Arc::ptr_eq(c, driver)) {
                if let Err(e) = driver.close() {
                    warn!("class driver close: {e}");
                }
                closed.push(driver);
            }
        }
        drop(drivers);

        self.shared.hal.disconnect()?;
        let mut runtime = self.shared.runtime.write().unwrap();
        *runtime = Runtime::new();
        Ok(())
    }

    /// Current state of the device state machine.
    pub fn state(&self) -> DeviceState {
        self.shared.runtime.read().unwrap().state
    }

    /// Currently assigned bus address (0 before SET_ADDRESS).
    pub fn address(&self) -> u8 {
        self.shared.runtime.read().unwrap().address
    }

    /// Active configuration value (0 when not configured).
    pub fn configuration_value(&self) -> u8 {
        self.shared.runtime.read().unwrap().configuration
    }

    /// An endpoint of the active configuration, for class drivers that
    /// stream outside their `init` context.
    pub fn endpoint(&self, address: u8) -> Result<EndpointHandle, UsbError> {
        let runtime = self.shared.runtime.read().unwrap();
        if runtime.state != DeviceState::Configured {
            return Err(UsbError::NotConfigured);
        }
        runtime
            .endpoints
            .get(&address)
            .cloned()
            .ok_or(UsbError::InvalidEndpoint)
    }
}

impl<H: DeviceHal + 'static> Drop for Device<H> {
    fn drop(&mut self) {
        if self.worker.lock().unwrap().is_some() {
            let _ = self.stop();
        }
    }
}

impl<H: DeviceHal + 'static> Shared<H> {
    fn serve_ep0(&self, ctx: &Context) {
        let mut response = [0u8; EP0_RESPONSE_CAPACITY];
        loop {
            if ctx.is_cancelled() {
                return;
            }
            match self.hal.read_ep0(ctx) {
                Ok(Ep0Event::Setup(setup, out_data)) => {
                    trace!(
                        "SETUP {:02x} {:02x} v={:04x} i={:04x} l={}",
                        setup.bmRequestType,
                        setup.bRequest,
                        setup.wValue,
                        setup.wIndex,
                        setup.wLength
                    );
                    match self.dispatch_setup(&setup, out_data.as_deref(), &mut response) {
                        Ok(()) => {}
                        Err(UsbError::Cancelled) => return,
                        Err(UsbError::Reset) => self.on_reset(),
                        Err(e) => {
                            debug!("request failed, stalling: {e}");
                            if let Err(e) = self.hal.stall_ep0() {
                                warn!("stall failed: {e}");
                            }
                        }
                    }
                }
                Ok(Ep0Event::Reset) => self.on_reset(),
                Err(UsbError::Cancelled) => return,
                Err(UsbError::Reset) => self.on_reset(),
                Err(e) => {
                    warn!("control endpoint read: {e}");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Bus reset: abandon in-flight control work, back to Default.
    /// Class drivers are not told; they observe a fresh `init` on the
    /// next configuration.
    fn on_reset(&self) {
        debug!("bus reset");
        let mut runtime = self.runtime.write().unwrap();
        if runtime.state.is_attached() {
            runtime.state = DeviceState::Default;
        }
        runtime.address = 0;
        runtime.configuration = 0;
        runtime.alternates.clear();
        runtime.endpoints.clear();
        self.hal.set_address(0);
    }

    fn dispatch_setup(
        &self,
        setup: &SetupPacket,
        out_data: Option<&[u8]>,
        response: &mut [u8],
    ) -> Result<(), UsbError> {
        match setup.kind() {
            RequestKind::Standard => self.handle_standard(setup, response),
            RequestKind::Class | RequestKind::Vendor => {
                self.handle_class(setup, out_data, response)
            }
            RequestKind::Reserved => Err(UsbError::InvalidRequest),
        }
    }

    /// IN data phase, truncated to `wLength`, then implicit status.
    fn reply_in(&self, setup: &SetupPacket, data: &[u8]) -> Result<(), UsbError> {
        let n = data.len().min(setup.wLength as usize);
        self.hal.write_ep0(&data[..n])
    }

    fn handle_standard(
        &self,
        setup: &SetupPacket,
        response: &mut [u8],
    ) -> Result<(), UsbError> {
        match setup.recipient() {
            Recipient::Device => self.standard_device(setup, response),
            Recipient::Interface => self.standard_interface(setup, response),
            Recipient::Endpoint => self.standard_endpoint(setup, response),
            _ => Err(UsbError::InvalidRequest),
        }
    }

    fn standard_device(
        &self,
        setup: &SetupPacket,
        response: &mut [u8],
    ) -> Result<(), UsbError> {
        match setup.bRequest {
            wire::GET_STATUS => {
                let runtime = self.runtime.read().unwrap();
                let mut status = 0u8;
                if self.tree.self_powered {
                    status |= 0x01;
                }
                if runtime.remote_wakeup_enabled {
                    status |= 0x02;
                }
                drop(runtime);
                self.reply_in(setup, &[status, 0])
            }
            wire::CLEAR_FEATURE | wire::SET_FEATURE => {
                if setup.wValue != wire::FEATURE_DEVICE_REMOTE_WAKEUP
                    || !self.tree.remote_wakeup
                {
                    return Err(UsbError::InvalidRequest);
                }
                self.runtime.write().unwrap().remote_wakeup_enabled =
                    setup.bRequest == wire::SET_FEATURE;
                self.hal.ack_ep0()
            }
            wire::SET_ADDRESS => {
                let address = (setup.wValue & 0x7F) as u8;
                {
                    let runtime = self.runtime.read().unwrap();
                    if !matches!(
                        runtime.state,
                        DeviceState::Default | DeviceState::Address
                    ) {
                        return Err(UsbError::InvalidRequest);
                    }
                }
                // The status phase completes at the old address; the
                // new one takes effect for subsequent transactions.
                self.hal.ack_ep0()?;
                let mut runtime = self.runtime.write().unwrap();
                runtime.address = address;
                runtime.state = if address != 0 {
                    DeviceState::Address
                } else {
                    DeviceState::Default
                };
                drop(runtime);
                self.hal.set_address(address);
                debug!("address set to {address}");
                Ok(())
            }
            wire::GET_DESCRIPTOR => self.get_descriptor(setup, response),
            wire::GET_CONFIGURATION => {
                let value = self.runtime.read().unwrap().configuration;
                self.reply_in(setup, &[value])
            }
            wire::SET_CONFIGURATION => self.set_configuration(setup),
            _ => Err(UsbError::InvalidRequest),
        }
    }

    fn get_descriptor(
        &self,
        setup: &SetupPacket,
        response: &mut [u8],
    ) -> Result<(), UsbError> {
        let descriptor_type = (setup.wValue >> 8) as u8;
        let index = (setup.wValue & 0xFF) as u8;
        let n = match descriptor_type {
            wire::DEVICE_DESCRIPTOR => {
                self.tree.device_descriptor().write_to(response)
            }
            wire::CONFIGURATION_DESCRIPTOR => {
                self.tree.write_configuration(index as usize, response)
            }
            wire::STRING_DESCRIPTOR => self.tree.write_string(index, response),
            wire::DEVICE_QUALIFIER_DESCRIPTOR => {
                if self.hal.speed() != UsbSpeed::High480 {
                    return Err(UsbError::InvalidRequest);
                }
                self.tree.device_qualifier().write_to(response)
            }
            _ => 0,
        };
        if n == 0 {
            return Err(UsbError::InvalidRequest);
        }
        self.reply_in(setup, &response[..n])
    }

    fn set_configuration(&self, setup: &SetupPacket) -> Result<(), UsbError> {
        let value = (setup.wValue & 0xFF) as u8;
        let mut runtime = self.runtime.write().unwrap();
        if !matches!(
            runtime.state,
            DeviceState::Address | DeviceState::Configured
        ) {
            return Err(UsbError::InvalidRequest);
        }

        if value == 0 {
            runtime.configuration = 0;
            runtime.state = DeviceState::Address;
            runtime.alternates.clear();
            runtime.endpoints.clear();
            drop(runtime);
            debug!("deconfigured");
            return self.hal.ack_ep0();
        }

        let Some(config) = self.tree.configuration(value) else {
            return Err(UsbError::InvalidRequest);
        };

        runtime.configuration = value;
        runtime.state = DeviceState::Configured;
        runtime.alternates.clear();
        runtime.endpoints.clear();
        for iface in config.interfaces.iter().filter(|i| i.alternate == 0) {
            runtime.alternates.insert(iface.number, 0);
            for ep in &iface.endpoints {
                runtime.endpoints.insert(
                    ep.address,
                    EndpointHandle::new(
                        self.hal.clone(),
                        ep.address,
                        ep.endpoint_type,
                        ep.max_packet_size,
                    ),
                );
            }
        }
        drop(runtime);
        debug!("configured, value {value}");
        self.hal.ack_ep0()?;

        // Status phase first, then driver init: drivers may start
        // streaming from inside init.
        let drivers = self.drivers.lock().unwrap();
        for ((config_value, iface_num), driver) in drivers.iter() {
            if *config_value != value {
                continue;
            }
            match self.interface_context(*iface_num) {
                Some(iface) => {
                    if let Err(e) = driver.init(&iface) {
                        warn!("class driver init (interface {iface_num}): {e}");
                    }
                }
                None => warn!("driver bound to missing interface {iface_num}"),
            }
        }
        Ok(())
    }

    fn standard_interface(
        &self,
        setup: &SetupPacket,
        _response: &mut [u8],
    ) -> Result<(), UsbError> {
        let number = (setup.wIndex & 0xFF) as u8;
        match setup.bRequest {
            wire::GET_STATUS => self.reply_in(setup, &[0, 0]),
            wire::GET_INTERFACE => {
                let runtime = self.runtime.read().unwrap();
                if runtime.state != DeviceState::Configured {
                    return Err(UsbError::InvalidRequest);
                }
                let Some(alt) = runtime.alternates.get(&number).copied() else {
                    return Err(UsbError::InvalidRequest);
                };
                drop(runtime);
                self.reply_in(setup, &[alt])
            }
            wire::SET_INTERFACE => self.set_interface(setup, number),
            _ => Err(UsbError::InvalidRequest),
        }
    }

    fn set_interface(&self, setup: &SetupPacket, number: u8) -> Result<(), UsbError> {
        let alternate = (setup.wValue & 0xFF) as u8;
        let mut runtime = self.runtime.write().unwrap();
        if runtime.state != DeviceState::Configured {
            return Err(UsbError::InvalidRequest);
        }
        let config_value = runtime.configuration;
        let Some(node) = self.tree.interface(config_value, number, alternate) else {
            return Err(UsbError::InvalidRequest);
        };

        // Swap the interface's endpoints for the new alternate's;
        // endpoint state (halt, toggle) restarts clean.
        if let Some(old_alt) = runtime.alternates.insert(number, alternate) {
            if let Some(old) = self.tree.interface(config_value, number, old_alt) {
                for ep in &old.endpoints {
                    runtime.endpoints.remove(&ep.address);
                }
            }
        }
        for ep in &node.endpoints {
            runtime.endpoints.insert(
                ep.address,
                EndpointHandle::new(
                    self.hal.clone(),
                    ep.address,
                    ep.endpoint_type,
                    ep.max_packet_size,
                ),
            );
        }
        drop(runtime);

        let driver = self
            .drivers
            .lock()
            .unwrap()
            .get(&(config_value, number))
            .cloned();
        if let Some(driver) = driver {
            if let Some(iface) = self.interface_context(number) {
                driver.set_alternate(&iface, alternate)?;
            }
        }
        self.hal.ack_ep0()
    }

    fn standard_endpoint(
        &self,
        setup: &SetupPacket,
        _response: &mut [u8],
    ) -> Result<(), UsbError> {
        let address = (setup.wIndex & 0xFF) as u8;
        match setup.bRequest {
            wire::GET_STATUS => {
                if wire::endpoint_number(address) == 0 {
                    return self.reply_in(setup, &[0, 0]);
                }
                let halted = self.endpoint_handle(address)?.is_halted();
                self.reply_in(setup, &[halted as u8, 0])
            }
            wire::CLEAR_FEATURE | wire::SET_FEATURE => {
                if setup.wValue != wire::FEATURE_ENDPOINT_HALT
                    || wire::endpoint_number(address) == 0
                {
                    return Err(UsbError::InvalidRequest);
                }
                self.endpoint_handle(address)?
                    .set_halted(setup.bRequest == wire::SET_FEATURE);
                self.hal.ack_ep0()
            }
            wire::SYNCH_FRAME => {
                let handle = self.endpoint_handle(address)?;
                if handle.endpoint_type() != EndpointType::Isochronous {
                    return Err(UsbError::InvalidRequest);
                }
                let frame = handle.frame_number();
                self.reply_in(setup, &frame.to_le_bytes())
            }
            _ => Err(UsbError::InvalidRequest),
        }
    }

    fn endpoint_handle(&self, address: u8) -> Result<EndpointHandle, UsbError> {
        self.runtime
            .read()
            .unwrap()
            .endpoints
            .get(&address)
            .cloned()
            .ok_or(UsbError::InvalidEndpoint)
    }

    /// Resolve a class/vendor SETUP to the interface whose driver owns
    /// it, call the driver, and complete the transaction it asked for.
    fn handle_class(
        &self,
        setup: &SetupPacket,
        out_data: Option<&[u8]>,
        response: &mut [u8],
    ) -> Result<(), UsbError> {
        let runtime = self.runtime.read().unwrap();
        let config_value = runtime.configuration;
        let number = match setup.recipient() {
            Recipient::Interface => (setup.wIndex & 0xFF) as u8,
            Recipient::Endpoint => {
                let address = (setup.wIndex & 0xFF) as u8;
                self.owning_interface(&runtime, address)
                    .ok_or(UsbError::InvalidEndpoint)?
            }
            // Device-recipient class requests go to the driver bound to
            // interface 0 of the active configuration.
            Recipient::Device | Recipient::Other => 0,
            Recipient::Reserved(_) => return Err(UsbError::InvalidRequest),
        };
        drop(runtime);

        let driver = self
            .drivers
            .lock()
            .unwrap()
            .get(&(config_value, number))
            .cloned()
            .ok_or(UsbError::InvalidRequest)?;
        let iface = self
            .interface_context(number)
            .ok_or(UsbError::NotConfigured)?;

        match driver.handle_setup(&iface, setup, out_data, response)? {
            SetupReply::NotHandled => Err(UsbError::InvalidRequest),
            SetupReply::InData(n) => {
                let n = n.min(response.len());
                let data = &response[..n];
                let n = data.len().min(setup.wLength as usize);
                self.hal.write_ep0(&data[..n])
            }
            SetupReply::Ack => self.hal.ack_ep0(),
        }
    }

    fn owning_interface(&self, runtime: &Runtime, ep_address: u8) -> Option<u8> {
        let config = self.tree.configuration(runtime.configuration)?;
        for iface in &config.interfaces {
            let selected = runtime.alternates.get(&iface.number).copied().unwrap_or(0);
            if iface.alternate != selected {
                continue;
            }
            if iface.endpoints.iter().any(|e| e.address == ep_address) {
                return Some(iface.number);
            }
        }
        None
    }

    /// Snapshot of an interface as the class driver sees it.
    fn interface_context(&self, number: u8) -> Option<InterfaceContext> {
        let runtime = self.runtime.read().unwrap();
        let config_value = runtime.configuration;
        let alternate = runtime.alternates.get(&number).copied().unwrap_or(0);
        let node = self.tree.interface(config_value, number, alternate)?;
        let endpoints = node
            .endpoints
            .iter()
            .filter_map(|ep| runtime.endpoints.get(&ep.address).cloned())
            .collect();
        Some(InterfaceContext {
            configuration_value: config_value,
            number,
            alternate,
            endpoints,
        })
    }
}

#[cfg(test)]
#[path = "tests/device.rs"]
mod tests;
