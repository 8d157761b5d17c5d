//! Records the host keeps for connected devices.

use softusb_core::types::{DeviceState, UsbSpeed};
use softusb_core::wire::{
    ConfigurationDescriptor, DescriptorVisitor, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// One interface of the active configuration, as read from the device.
#[derive(Debug, Clone)]
pub struct ParsedInterface {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Descriptor types the core does not model, kept verbatim against
    /// the interface that owns them.
    pub class_descriptors: Vec<Vec<u8>>,
}

/// A configuration descriptor tree parsed into shape.
#[derive(Debug, Clone)]
pub struct ParsedConfiguration {
    pub descriptor: ConfigurationDescriptor,
    /// Class-specific blobs that appeared before any interface.
    pub class_descriptors: Vec<Vec<u8>>,
    pub interfaces: Vec<ParsedInterface>,
}

impl ParsedConfiguration {
    /// The interface/endpoint lists of a configuration buffer. Only
    /// complete descriptors are taken; a truncated tail is dropped.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let mut v = ParseVisitor::default();
        softusb_core::wire::parse_descriptors(buf, &mut v);
        let descriptor = v.configuration?;
        Some(Self {
            descriptor,
            class_descriptors: v.leading_others,
            interfaces: v.interfaces,
        })
    }

    /// Find an endpoint descriptor by endpoint address.
    pub fn endpoint(&self, ep_address: u8) -> Option<&EndpointDescriptor> {
        self.interfaces
            .iter()
            .flat_map(|i| i.endpoints.iter())
            .find(|e| e.bEndpointAddress == ep_address)
    }
}

#[derive(Default)]
struct ParseVisitor {
    configuration: Option<ConfigurationDescriptor>,
    leading_others: Vec<Vec<u8>>,
    interfaces: Vec<ParsedInterface>,
}

impl DescriptorVisitor for ParseVisitor {
    fn on_configuration(&mut self, c: &ConfigurationDescriptor) {
        if self.configuration.is_none() {
            self.configuration = Some(*c);
        }
    }

    fn on_interface(&mut self, i: &InterfaceDescriptor) {
        self.interfaces.push(ParsedInterface {
            descriptor: *i,
            endpoints: Vec::new(),
            class_descriptors: Vec::new(),
        });
    }

    fn on_endpoint(&mut self, e: &EndpointDescriptor) {
        if let Some(iface) = self.interfaces.last_mut() {
            iface.endpoints.push(*e);
        }
    }

    fn on_other(&mut self, d: &[u8]) {
        match self.interfaces.last_mut() {
            Some(iface) => iface.class_descriptors.push(d.to_vec()),
            None => self.leading_others.push(d.to_vec()),
        }
    }
}

/// A fully enumerated device.
#[derive(Debug)]
pub struct HostDevice {
    pub address: u8,
    pub port: u8,
    pub speed: UsbSpeed,
    pub max_packet_size_ep0: u8,
    pub descriptor: DeviceDescriptor,
    pub configuration: ParsedConfiguration,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    state: RwLock<DeviceState>,
    gone: AtomicBool,
}

impl HostDevice {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: u8,
        port: u8,
        speed: UsbSpeed,
        max_packet_size_ep0: u8,
        descriptor: DeviceDescriptor,
        configuration: ParsedConfiguration,
        manufacturer: Option<String>,
        product: Option<String>,
        serial_number: Option<String>,
    ) -> Self {
        Self {
            address,
            port,
            speed,
            max_packet_size_ep0,
            descriptor,
            configuration,
            manufacturer,
            product,
            serial_number,
            state: RwLock::new(DeviceState::Configured),
            gone: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> DeviceState {
        *self.state.read().unwrap()
    }

    pub(crate) fn mark_detached(&self) {
        self.gone.store(true, Ordering::Release);
        *self.state.write().unwrap() = DeviceState::Detached;
    }

    /// Whether a disconnect has been observed for this device.
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[path = "tests/device.rs"]
mod tests;
