//! Bit-exact USB 2.0 chapter-9 wire structures.
//!
//! Everything here is little-endian and laid out exactly as on the bus.
//! Parsers take `&[u8]` and return the typed structure together with the
//! number of bytes consumed; they fail with [`UsbError::ShortBuffer`]
//! when the input is smaller than the length the data claims.
//! Marshallers write into a caller-provided buffer and return the number
//! of bytes written, returning `0` when the buffer is too small; they
//! never allocate.

use crate::error::UsbError;
use crate::types::Direction;

// For bmRequestType (USB 2.0 table 9-2)
pub const DEVICE_TO_HOST: u8 = 0x80;
pub const HOST_TO_DEVICE: u8 = 0;
pub const STANDARD_REQUEST: u8 = 0;
pub const CLASS_REQUEST: u8 = 0x20;
pub const VENDOR_REQUEST: u8 = 0x40;
pub const RECIPIENT_DEVICE: u8 = 0;
pub const RECIPIENT_INTERFACE: u8 = 1;
pub const RECIPIENT_ENDPOINT: u8 = 2;
pub const RECIPIENT_OTHER: u8 = 3;

// For bRequest (USB 2.0 table 9-4)
pub const GET_STATUS: u8 = 0;
pub const CLEAR_FEATURE: u8 = 1;
pub const SET_FEATURE: u8 = 3;
pub const SET_ADDRESS: u8 = 5;
pub const GET_DESCRIPTOR: u8 = 6;
pub const SET_DESCRIPTOR: u8 = 7;
pub const GET_CONFIGURATION: u8 = 8;
pub const SET_CONFIGURATION: u8 = 9;
pub const GET_INTERFACE: u8 = 10;
pub const SET_INTERFACE: u8 = 11;
pub const SYNCH_FRAME: u8 = 12;

// Descriptor types (USB 2.0 table 9-5)
pub const DEVICE_DESCRIPTOR: u8 = 1;
pub const CONFIGURATION_DESCRIPTOR: u8 = 2;
pub const STRING_DESCRIPTOR: u8 = 3;
pub const INTERFACE_DESCRIPTOR: u8 = 4;
pub const ENDPOINT_DESCRIPTOR: u8 = 5;
pub const DEVICE_QUALIFIER_DESCRIPTOR: u8 = 6;

// Feature selectors (USB 2.0 table 9-6)
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// US English, the language ID virtually every device reports first.
pub const LANGID_EN_US: u16 = 0x0409;

/// Direction flag of an endpoint address byte (set = IN, device to host).
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Pack an endpoint number (1..=15, or 0 for the default control pipe)
/// and a direction into an endpoint address byte.
pub const fn endpoint_address(number: u8, direction: Direction) -> u8 {
    let dir = match direction {
        Direction::In => ENDPOINT_DIR_IN,
        Direction::Out => 0,
    };
    (number & 0x0F) | dir
}

/// Endpoint number from an endpoint address byte.
pub const fn endpoint_number(address: u8) -> u8 {
    address & 0x0F
}

/// Direction from an endpoint address byte. Endpoint 0 is bidirectional;
/// for it the bit is meaningless and callers should ignore the result.
pub const fn endpoint_direction(address: u8) -> Direction {
    if address & ENDPOINT_DIR_IN != 0 {
        Direction::In
    } else {
        Direction::Out
    }
}

/// The type field of `bmRequestType`, bits 6..5.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// The recipient field of `bmRequestType`, bits 4..0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

/// A SETUP packet as transmitted on control endpoints.
///
/// All transactions on control endpoints start with a SETUP packet of
/// this format, sometimes followed by IN or OUT data packets. The
/// format (and the un-Rust-like field names) are defined by USB 2.0
/// section 9.3; class specifications dictate what goes in the fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-2
pub struct SetupPacket {
    /// The type and specific target of the request.
    pub bmRequestType: u8,
    /// The particular request.
    pub bRequest: u8,
    /// A parameter to the request.
    pub wValue: u16,
    /// A second parameter to the request.
    pub wIndex: u16,
    /// The length of the subsequent IN or OUT data phase; zero if the
    /// setup packet itself carries all the required information.
    pub wLength: u16,
}

impl SetupPacket {
    /// Size of a SETUP packet on the wire.
    pub const SIZE: usize = 8;

    /// Direction of the data phase (bit 7 of `bmRequestType`).
    pub fn direction(&self) -> Direction {
        if self.bmRequestType & DEVICE_TO_HOST != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Request type: standard, class, or vendor.
    pub fn kind(&self) -> RequestKind {
        match self.bmRequestType & 0x60 {
            STANDARD_REQUEST => RequestKind::Standard,
            CLASS_REQUEST => RequestKind::Class,
            VENDOR_REQUEST => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    /// Addressed recipient: device, interface, endpoint, or other.
    pub fn recipient(&self) -> Recipient {
        match self.bmRequestType & 0x1F {
            RECIPIENT_DEVICE => Recipient::Device,
            RECIPIENT_INTERFACE => Recipient::Interface,
            RECIPIENT_ENDPOINT => Recipient::Endpoint,
            RECIPIENT_OTHER => Recipient::Other,
            n => Recipient::Reserved(n),
        }
    }

    /// Decode a SETUP packet from the first 8 bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), UsbError> {
        if buf.len() < Self::SIZE {
            return Err(UsbError::ShortBuffer);
        }
        Ok((
            Self {
                bmRequestType: buf[0],
                bRequest: buf[1],
                wValue: u16::from_le_bytes([buf[2], buf[3]]),
                wIndex: u16::from_le_bytes([buf[4], buf[5]]),
                wLength: u16::from_le_bytes([buf[6], buf[7]]),
            },
            Self::SIZE,
        ))
    }

    /// Encode into `out`, returning 8, or 0 if `out` is too small.
    pub fn write_to(&self, out: &mut [u8]) -> usize {
        if out.len() < Self::SIZE {
            return 0;
        }
        out[0] = self.bmRequestType;
        out[1] = self.bRequest;
        out[2..4].copy_from_slice(&self.wValue.to_le_bytes());
        out[4..6].copy_from_slice(&self.wIndex.to_le_bytes());
        out[6..8].copy_from_slice(&self.wLength.to_le_bytes());
        Self::SIZE
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-8
pub struct DeviceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: [u8; 2],
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub idVendor: [u8; 2],
    pub idProduct: [u8; 2],
    pub bcdDevice: [u8; 2],
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for DeviceDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for DeviceDescriptor {}

impl DeviceDescriptor {
    pub fn vid(&self) -> u16 {
        u16::from_le_bytes(self.idVendor)
    }

    pub fn pid(&self) -> u16 {
        u16::from_le_bytes(self.idProduct)
    }

    pub fn release(&self) -> u16 {
        u16::from_le_bytes(self.bcdDevice)
    }

    pub fn parse(buf: &[u8]) -> Result<(Self, usize), UsbError> {
        parse_fixed(buf, DEVICE_DESCRIPTOR)
    }

    pub fn write_to(&self, out: &mut [u8]) -> usize {
        write_fixed(self, out)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-10
pub struct ConfigurationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wTotalLength: [u8; 2],
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for ConfigurationDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for ConfigurationDescriptor {}

impl ConfigurationDescriptor {
    pub fn total_length(&self) -> u16 {
        u16::from_le_bytes(self.wTotalLength)
    }

    /// Parse the 9-byte header; the interface/endpoint tree that follows
    /// (through `wTotalLength`) is walked with [`parse_descriptors`].
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), UsbError> {
        parse_fixed(buf, CONFIGURATION_DESCRIPTOR)
    }

    pub fn write_to(&self, out: &mut [u8]) -> usize {
        write_fixed(self, out)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-12
pub struct InterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for InterfaceDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for InterfaceDescriptor {}

impl InterfaceDescriptor {
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), UsbError> {
        parse_fixed(buf, INTERFACE_DESCRIPTOR)
    }

    pub fn write_to(&self, out: &mut [u8]) -> usize {
        write_fixed(self, out)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-13
pub struct EndpointDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: [u8; 2],
    pub bInterval: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for EndpointDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for EndpointDescriptor {}

impl EndpointDescriptor {
    pub fn max_packet_size(&self) -> u16 {
        u16::from_le_bytes(self.wMaxPacketSize)
    }

    pub fn parse(buf: &[u8]) -> Result<(Self, usize), UsbError> {
        parse_fixed(buf, ENDPOINT_DESCRIPTOR)
    }

    pub fn write_to(&self, out: &mut [u8]) -> usize {
        write_fixed(self, out)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-9
pub struct DeviceQualifierDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: [u8; 2],
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub bNumConfigurations: u8,
    pub bReserved: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for DeviceQualifierDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for DeviceQualifierDescriptor {}

impl DeviceQualifierDescriptor {
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), UsbError> {
        parse_fixed(buf, DEVICE_QUALIFIER_DESCRIPTOR)
    }

    pub fn write_to(&self, out: &mut [u8]) -> usize {
        write_fixed(self, out)
    }
}

/// Shared body of the fixed-size descriptor parsers.
///
/// `bLength` must cover at least the structure, the type byte must
/// match, and the input must contain the whole claimed length.
fn parse_fixed<T: bytemuck::Pod>(
    buf: &[u8],
    descriptor_type: u8,
) -> Result<(T, usize), UsbError> {
    let size = core::mem::size_of::<T>();
    if buf.len() < 2 {
        return Err(UsbError::ShortBuffer);
    }
    let dlen = buf[0] as usize;
    if buf[1] != descriptor_type || dlen < size {
        return Err(UsbError::InvalidDescriptor);
    }
    if buf.len() < dlen {
        return Err(UsbError::ShortBuffer);
    }
    // All descriptor structs are byte arrays under the hood, so this
    // cannot fail on alignment.
    let value = bytemuck::pod_read_unaligned(&buf[..size]);
    Ok((value, dlen))
}

fn write_fixed<T: bytemuck::Pod>(value: &T, out: &mut [u8]) -> usize {
    let bytes = bytemuck::bytes_of(value);
    if out.len() < bytes.len() {
        return 0;
    }
    out[..bytes.len()].copy_from_slice(bytes);
    bytes.len()
}

/// Parse a string descriptor, projecting the UTF-16LE payload to ASCII.
///
/// Code units outside the ASCII range are dropped. Returns the string
/// and the bytes consumed.
pub fn parse_string_descriptor(buf: &[u8]) -> Result<(String, usize), UsbError> {
    if buf.len() < 2 {
        return Err(UsbError::ShortBuffer);
    }
    let dlen = buf[0] as usize;
    if buf[1] != STRING_DESCRIPTOR || dlen < 2 {
        return Err(UsbError::InvalidDescriptor);
    }
    if buf.len() < dlen {
        return Err(UsbError::ShortBuffer);
    }
    let mut s = String::new();
    let mut i = 2;
    while i + 1 < dlen {
        let unit = u16::from_le_bytes([buf[i], buf[i + 1]]);
        if unit < 0x80 {
            s.push(unit as u8 as char);
        }
        i += 2;
    }
    Ok((s, dlen))
}

/// Parse the language-ID array a device returns for string index 0.
pub fn parse_langid_descriptor(buf: &[u8]) -> Result<(Vec<u16>, usize), UsbError> {
    if buf.len() < 2 {
        return Err(UsbError::ShortBuffer);
    }
    let dlen = buf[0] as usize;
    if buf[1] != STRING_DESCRIPTOR || dlen < 4 {
        return Err(UsbError::InvalidDescriptor);
    }
    if buf.len() < dlen {
        return Err(UsbError::ShortBuffer);
    }
    let mut ids = Vec::new();
    let mut i = 2;
    while i + 1 < dlen {
        ids.push(u16::from_le_bytes([buf[i], buf[i + 1]]));
        i += 2;
    }
    Ok((ids, dlen))
}

/// Marshal a string descriptor (UTF-16LE payload) into `out`.
///
/// Strings longer than 126 code units do not fit the one-byte length
/// field and are refused with a `0` return, like any too-small buffer.
pub fn write_string_descriptor(s: &str, out: &mut [u8]) -> usize {
    let units: usize = s.encode_utf16().count();
    if units > 126 {
        return 0;
    }
    let dlen = 2 + units * 2;
    if out.len() < dlen {
        return 0;
    }
    out[0] = dlen as u8;
    out[1] = STRING_DESCRIPTOR;
    let mut i = 2;
    for unit in s.encode_utf16() {
        out[i..i + 2].copy_from_slice(&unit.to_le_bytes());
        i += 2;
    }
    dlen
}

/// Marshal the language-ID array served at string index 0.
pub fn write_langid_descriptor(langids: &[u16], out: &mut [u8]) -> usize {
    let dlen = 2 + langids.len() * 2;
    if dlen > 255 || out.len() < dlen {
        return 0;
    }
    out[0] = dlen as u8;
    out[1] = STRING_DESCRIPTOR;
    let mut i = 2;
    for id in langids {
        out[i..i + 2].copy_from_slice(&id.to_le_bytes());
        i += 2;
    }
    dlen
}

/// Callbacks for walking a configuration descriptor tree.
///
/// `parse_descriptors` hands each interface, endpoint, and
/// class-specific blob to the visitor in wire order; descriptor types it
/// does not model go to `on_other` verbatim.
pub trait DescriptorVisitor {
    fn on_configuration(&mut self, _c: &ConfigurationDescriptor) {}
    fn on_interface(&mut self, _i: &InterfaceDescriptor) {}
    fn on_endpoint(&mut self, _e: &EndpointDescriptor) {}
    fn on_other(&mut self, _d: &[u8]) {}
}

/// Walk the concatenated descriptor tree that follows a configuration
/// descriptor header.
///
/// Truncated trailing descriptors are skipped rather than surfaced
/// partially parsed; malformed interior lengths end the walk.
pub fn parse_descriptors(buf: &[u8], v: &mut impl DescriptorVisitor) {
    let mut index = 0;

    while buf.len() > index + 2 {
        let dlen = buf[index] as usize;
        let dtype = buf[index + 1];

        if dlen < 2 || buf.len() < index + dlen {
            return;
        }

        let bytes = &buf[index..index + dlen];
        match dtype {
            CONFIGURATION_DESCRIPTOR => {
                if let Ok((c, _)) = ConfigurationDescriptor::parse(bytes) {
                    v.on_configuration(&c);
                }
            }
            INTERFACE_DESCRIPTOR => {
                if let Ok((i, _)) = InterfaceDescriptor::parse(bytes) {
                    v.on_interface(&i);
                }
            }
            ENDPOINT_DESCRIPTOR => {
                if let Ok((e, _)) = EndpointDescriptor::parse(bytes) {
                    v.on_endpoint(&e);
                }
            }
            _ => v.on_other(bytes),
        }

        index += dlen;
    }
}

#[cfg(test)]
#[path = "tests/wire.rs"]
mod tests;
