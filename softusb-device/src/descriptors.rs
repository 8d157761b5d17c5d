//! The device's descriptor tree: built fluently, validated once,
//! frozen thereafter.
//!
//! The tree is an arena: the device owns configurations, which own
//! interfaces, which own endpoints, and everything downstream refers
//! to nodes by (configuration value, interface number, alternate)
//! triples rather than by pointer.

use softusb_core::error::UsbError;
use softusb_core::types::{Direction, EndpointType};
use softusb_core::wire::{
    self, ConfigurationDescriptor, DeviceDescriptor, DeviceQualifierDescriptor,
    EndpointDescriptor, InterfaceDescriptor,
};

/// One endpoint of an interface.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub address: u8,
    pub endpoint_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// One (interface number, alternate setting) node.
#[derive(Debug, Clone)]
pub struct InterfaceNode {
    pub number: u8,
    pub alternate: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
    pub endpoints: Vec<EndpointSpec>,
    /// Class-specific descriptor blobs emitted verbatim after the
    /// interface descriptor.
    pub class_descriptors: Vec<Vec<u8>>,
}

/// One configuration node.
#[derive(Debug, Clone)]
pub struct ConfigurationNode {
    pub value: u8,
    pub string_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<InterfaceNode>,
}

/// The frozen descriptor tree. Readers never need a lock.
#[derive(Debug, Clone)]
pub struct DescriptorTree {
    pub vendor_id: u16,
    pub product_id: u16,
    pub release: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_ep0: u8,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    /// String descriptors; index 1 on the wire is `strings[0]`.
    pub strings: Vec<String>,
    pub configurations: Vec<ConfigurationNode>,
}

impl DescriptorTree {
    /// The 18-byte device descriptor.
    pub fn device_descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            bLength: 18,
            bDescriptorType: wire::DEVICE_DESCRIPTOR,
            bcdUSB: 0x0200u16.to_le_bytes(),
            bDeviceClass: self.class,
            bDeviceSubClass: self.subclass,
            bDeviceProtocol: self.protocol,
            bMaxPacketSize0: self.max_packet_size_ep0,
            idVendor: self.vendor_id.to_le_bytes(),
            idProduct: self.product_id.to_le_bytes(),
            bcdDevice: self.release.to_le_bytes(),
            iManufacturer: self.manufacturer_index,
            iProduct: self.product_index,
            iSerialNumber: self.serial_index,
            bNumConfigurations: self.configurations.len() as u8,
        }
    }

    /// The device-qualifier descriptor served to high-speed hosts.
    pub fn device_qualifier(&self) -> DeviceQualifierDescriptor {
        DeviceQualifierDescriptor {
            bLength: 10,
            bDescriptorType: wire::DEVICE_QUALIFIER_DESCRIPTOR,
            bcdUSB: 0x0200u16.to_le_bytes(),
            bDeviceClass: self.class,
            bDeviceSubClass: self.subclass,
            bDeviceProtocol: self.protocol,
            bMaxPacketSize0: self.max_packet_size_ep0,
            bNumConfigurations: self.configurations.len() as u8,
            bReserved: 0,
        }
    }

    pub fn configuration(&self, value: u8) -> Option<&ConfigurationNode> {
        self.configurations.iter().find(|c| c.value == value)
    }

    pub fn interface(
        &self,
        config_value: u8,
        number: u8,
        alternate: u8,
    ) -> Option<&InterfaceNode> {
        self.configuration(config_value)?
            .interfaces
            .iter()
            .find(|i| i.number == number && i.alternate == alternate)
    }

    /// Total `wTotalLength` of the configuration at array index `index`.
    fn configuration_total_length(config: &ConfigurationNode) -> usize {
        let mut total = 9;
        for iface in &config.interfaces {
            total += 9;
            for blob in &iface.class_descriptors {
                total += blob.len();
            }
            total += iface.endpoints.len() * 7;
        }
        total
    }

    /// Marshal the complete configuration tree (header, interfaces,
    /// class-specific blobs, endpoints) for the configuration at array
    /// index `index`. Returns bytes written, 0 if `out` is too small or
    /// the index does not exist.
    pub fn write_configuration(&self, index: usize, out: &mut [u8]) -> usize {
        let Some(config) = self.configurations.get(index) else {
            return 0;
        };
        let total = Self::configuration_total_length(config);
        if out.len() < total || total > u16::MAX as usize {
            return 0;
        }

        let distinct_interfaces = {
            let mut numbers: Vec<u8> = config.interfaces.iter().map(|i| i.number).collect();
            numbers.sort_unstable();
            numbers.dedup();
            numbers.len() as u8
        };

        let header = ConfigurationDescriptor {
            bLength: 9,
            bDescriptorType: wire::CONFIGURATION_DESCRIPTOR,
            wTotalLength: (total as u16).to_le_bytes(),
            bNumInterfaces: distinct_interfaces,
            bConfigurationValue: config.value,
            iConfiguration: config.string_index,
            bmAttributes: config.attributes,
            bMaxPower: config.max_power,
        };
        let mut off = header.write_to(out);

        for iface in &config.interfaces {
            let d = InterfaceDescriptor {
                bLength: 9,
                bDescriptorType: wire::INTERFACE_DESCRIPTOR,
                bInterfaceNumber: iface.number,
                bAlternateSetting: iface.alternate,
                bNumEndpoints: iface.endpoints.len() as u8,
                bInterfaceClass: iface.class,
                bInterfaceSubClass: iface.subclass,
                bInterfaceProtocol: iface.protocol,
                iInterface: iface.string_index,
            };
            off += d.write_to(&mut out[off..]);
            for blob in &iface.class_descriptors {
                out[off..off + blob.len()].copy_from_slice(blob);
                off += blob.len();
            }
            for ep in &iface.endpoints {
                let d = EndpointDescriptor {
                    bLength: 7,
                    bDescriptorType: wire::ENDPOINT_DESCRIPTOR,
                    bEndpointAddress: ep.address,
                    bmAttributes: ep.endpoint_type as u8,
                    wMaxPacketSize: ep.max_packet_size.to_le_bytes(),
                    bInterval: ep.interval,
                };
                off += d.write_to(&mut out[off..]);
            }
        }
        debug_assert_eq!(off, total);
        off
    }

    /// Marshal string descriptor `index` (0 = the language table).
    pub fn write_string(&self, index: u8, out: &mut [u8]) -> usize {
        if index == 0 {
            return wire::write_langid_descriptor(&[wire::LANGID_EN_US], out);
        }
        match self.strings.get(index as usize - 1) {
            Some(s) => wire::write_string_descriptor(s, out),
            None => 0,
        }
    }
}

/// Fluent construction of a [`DescriptorTree`].
///
/// ```no_run
/// # use softusb_device::{DeviceBuilder, ConfigurationBuilder, InterfaceBuilder};
/// # use softusb_core::types::EndpointType;
/// let tree = DeviceBuilder::new(0x1234, 0x5678)
///     .manufacturer("SoftUSB Example")
///     .product("CDC-ACM Serial Port")
///     .serial_number("12345678")
///     .configuration(
///         ConfigurationBuilder::new(1)
///             .interface(
///                 InterfaceBuilder::new(0)
///                     .class(0x02, 0x02, 0x01)
///                     .endpoint(0x81, EndpointType::Interrupt, 8, 10),
///             ),
///     )
///     .build()
///     .unwrap();
/// ```
pub struct DeviceBuilder {
    tree: DescriptorTree,
}

impl DeviceBuilder {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            tree: DescriptorTree {
                vendor_id,
                product_id,
                release: 0x0100,
                class: 0,
                subclass: 0,
                protocol: 0,
                max_packet_size_ep0: 64,
                manufacturer_index: 0,
                product_index: 0,
                serial_index: 0,
                self_powered: false,
                remote_wakeup: false,
                strings: Vec::new(),
                configurations: Vec::new(),
            },
        }
    }

    pub fn release(mut self, bcd: u16) -> Self {
        self.tree.release = bcd;
        self
    }

    pub fn device_class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.tree.class = class;
        self.tree.subclass = subclass;
        self.tree.protocol = protocol;
        self
    }

    pub fn max_packet_size_ep0(mut self, size: u8) -> Self {
        self.tree.max_packet_size_ep0 = size;
        self
    }

    pub fn self_powered(mut self, yes: bool) -> Self {
        self.tree.self_powered = yes;
        self
    }

    pub fn remote_wakeup(mut self, yes: bool) -> Self {
        self.tree.remote_wakeup = yes;
        self
    }

    fn intern(&mut self, s: &str) -> u8 {
        self.tree.strings.push(s.to_owned());
        self.tree.strings.len() as u8
    }

    pub fn manufacturer(mut self, s: &str) -> Self {
        self.tree.manufacturer_index = self.intern(s);
        self
    }

    pub fn product(mut self, s: &str) -> Self {
        self.tree.product_index = self.intern(s);
        self
    }

    pub fn serial_number(mut self, s: &str) -> Self {
        self.tree.serial_index = self.intern(s);
        self
    }

    pub fn configuration(mut self, config: ConfigurationBuilder) -> Self {
        let mut node = config.node;
        if let Some(name) = config.name {
            node.string_index = self.intern(&name);
        }
        for (i, name) in config.interface_names {
            let index = self.intern(&name);
            for iface in node.interfaces.iter_mut().filter(|f| f.number == i) {
                iface.string_index = index;
            }
        }
        self.tree.configurations.push(node);
        self
    }

    /// Validate and freeze the tree.
    pub fn build(self) -> Result<DescriptorTree, UsbError> {
        let tree = self.tree;
        if tree.configurations.is_empty() {
            return Err(UsbError::InvalidDescriptor);
        }
        let mut values = Vec::new();
        for config in &tree.configurations {
            if config.value == 0 || values.contains(&config.value) {
                return Err(UsbError::InvalidDescriptor);
            }
            values.push(config.value);
            if config.string_index as usize > tree.strings.len() {
                return Err(UsbError::InvalidDescriptor);
            }
            for iface in &config.interfaces {
                if iface.string_index as usize > tree.strings.len() {
                    return Err(UsbError::InvalidDescriptor);
                }
                let mut seen: Vec<(u8, Direction)> = Vec::new();
                for ep in &iface.endpoints {
                    let number = wire::endpoint_number(ep.address);
                    let direction = wire::endpoint_direction(ep.address);
                    if number == 0 || number > 15 {
                        return Err(UsbError::InvalidDescriptor);
                    }
                    if seen.contains(&(number, direction)) {
                        return Err(UsbError::InvalidDescriptor);
                    }
                    seen.push((number, direction));
                }
            }
        }
        for index in [
            tree.manufacturer_index,
            tree.product_index,
            tree.serial_index,
        ] {
            if index as usize > tree.strings.len() {
                return Err(UsbError::InvalidDescriptor);
            }
        }
        Ok(tree)
    }
}

/// Builder for one configuration.
pub struct ConfigurationBuilder {
    node: ConfigurationNode,
    name: Option<String>,
    interface_names: Vec<(u8, String)>,
}

impl ConfigurationBuilder {
    pub fn new(value: u8) -> Self {
        Self {
            node: ConfigurationNode {
                value,
                string_index: 0,
                attributes: 0x80, // bus powered, reserved bit 7 set
                max_power: 50,    // 100 mA in 2 mA units
                interfaces: Vec::new(),
            },
            name: None,
            interface_names: Vec::new(),
        }
    }

    pub fn name(mut self, s: &str) -> Self {
        self.name = Some(s.to_owned());
        self
    }

    pub fn attributes(mut self, attributes: u8) -> Self {
        self.node.attributes = attributes;
        self
    }

    pub fn max_power_ma(mut self, milliamps: u16) -> Self {
        self.node.max_power = (milliamps / 2).min(255) as u8;
        self
    }

    pub fn interface(mut self, iface: InterfaceBuilder) -> Self {
        if let Some(name) = iface.name {
            self.interface_names.push((iface.node.number, name));
        }
        self.node.interfaces.push(iface.node);
        self
    }
}

/// Builder for one (interface, alternate setting) node.
pub struct InterfaceBuilder {
    node: InterfaceNode,
    name: Option<String>,
}

impl InterfaceBuilder {
    pub fn new(number: u8) -> Self {
        Self {
            node: InterfaceNode {
                number,
                alternate: 0,
                class: 0,
                subclass: 0,
                protocol: 0,
                string_index: 0,
                endpoints: Vec::new(),
                class_descriptors: Vec::new(),
            },
            name: None,
        }
    }

    pub fn alternate(mut self, alt: u8) -> Self {
        self.node.alternate = alt;
        self
    }

    pub fn class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.node.class = class;
        self.node.subclass = subclass;
        self.node.protocol = protocol;
        self
    }

    pub fn name(mut self, s: &str) -> Self {
        self.name = Some(s.to_owned());
        self
    }

    pub fn endpoint(
        mut self,
        address: u8,
        endpoint_type: EndpointType,
        max_packet_size: u16,
        interval: u8,
    ) -> Self {
        self.node.endpoints.push(EndpointSpec {
            address,
            endpoint_type,
            max_packet_size,
            interval,
        });
        self
    }

    /// Append a class-specific descriptor blob (HID descriptor, CDC
    /// functional descriptors, ...) emitted after the interface
    /// descriptor.
    pub fn class_descriptor(mut self, bytes: &[u8]) -> Self {
        self.node.class_descriptors.push(bytes.to_vec());
        self
    }
}

#[cfg(test)]
#[path = "tests/descriptors.rs"]
mod tests;
