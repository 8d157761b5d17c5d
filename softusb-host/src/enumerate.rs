//! The enumeration sequence run for every device that appears on a
//! port.

use crate::device::{HostDevice, ParsedConfiguration};
use log::{debug, warn};
use softusb_core::context::Context;
use softusb_core::error::UsbError;
use softusb_core::host_hal::{DataPhase, HostHal};
use softusb_core::types::UsbSpeed;
use softusb_core::wire::{
    self, DeviceDescriptor, SetupPacket, DEVICE_TO_HOST, GET_DESCRIPTOR, HOST_TO_DEVICE,
    SET_ADDRESS, SET_CONFIGURATION,
};

/// Upper bound on a configuration descriptor tree we will read; longer
/// trees are truncated here and parsed to the last complete descriptor.
pub(crate) const CONFIG_BUFFER_CAPACITY: usize = 4096;

fn get_descriptor_setup(descriptor_type: u8, index: u8, langid: u16, length: u16) -> SetupPacket {
    SetupPacket {
        bmRequestType: DEVICE_TO_HOST,
        bRequest: GET_DESCRIPTOR,
        wValue: ((descriptor_type as u16) << 8) | index as u16,
        wIndex: langid,
        wLength: length,
    }
}

/// Reset the port and read the first 8 bytes of the device descriptor
/// at address 0 to learn the control-endpoint packet size.
pub(crate) fn reset_and_probe<H: HostHal>(
    hal: &H,
    ctx: &Context,
    port: u8,
) -> Result<u8, UsbError> {
    hal.reset_port(ctx, port)?;

    let mut prefix = [0u8; 8];
    let n = hal.control_transfer(
        ctx,
        port,
        0,
        get_descriptor_setup(wire::DEVICE_DESCRIPTOR, 0, 0, 8),
        DataPhase::In(&mut prefix),
    )?;
    // A zero (or missing) bMaxPacketSize0 gets the low-speed default.
    let max_packet = if n >= 8 { prefix[7] } else { 0 };
    Ok(if max_packet == 0 { 8 } else { max_packet })
}

/// Address assignment through configuration: everything after the host
/// has picked an address for the probed device.
///
/// `aborted` is polled between steps so a disconnect observed by the
/// hotplug thread stops the sequence promptly.
pub(crate) fn enumerate_at<H: HostHal>(
    hal: &H,
    ctx: &Context,
    port: u8,
    speed: UsbSpeed,
    address: u8,
    max_packet_size_ep0: u8,
    aborted: &dyn Fn() -> bool,
) -> Result<HostDevice, UsbError> {
    let check = |aborted: &dyn Fn() -> bool| -> Result<(), UsbError> {
        if aborted() {
            Err(UsbError::NoDevice)
        } else {
            ctx.check()
        }
    };

    check(aborted)?;
    hal.control_transfer(
        ctx,
        port,
        0,
        SetupPacket {
            bmRequestType: HOST_TO_DEVICE,
            bRequest: SET_ADDRESS,
            wValue: address as u16,
            wIndex: 0,
            wLength: 0,
        },
        DataPhase::None,
    )?;
    hal.assign_address(ctx, port, address)?;
    debug!("port {port}: assigned address {address}");

    check(aborted)?;
    let mut descriptor_buf = [0u8; 18];
    let n = hal.control_transfer(
        ctx,
        port,
        address,
        get_descriptor_setup(wire::DEVICE_DESCRIPTOR, 0, 0, 18),
        DataPhase::In(&mut descriptor_buf),
    )?;
    let (descriptor, _) = DeviceDescriptor::parse(&descriptor_buf[..n])?;

    check(aborted)?;
    let mut header = [0u8; 9];
    let n = hal.control_transfer(
        ctx,
        port,
        address,
        get_descriptor_setup(wire::CONFIGURATION_DESCRIPTOR, 0, 0, 9),
        DataPhase::In(&mut header),
    )?;
    let (config_header, _) = wire::ConfigurationDescriptor::parse(&header[..n])?;
    let total = (config_header.total_length() as usize).min(CONFIG_BUFFER_CAPACITY);

    check(aborted)?;
    let mut config_buf = vec![0u8; total];
    let n = hal.control_transfer(
        ctx,
        port,
        address,
        get_descriptor_setup(wire::CONFIGURATION_DESCRIPTOR, 0, 0, total as u16),
        DataPhase::In(&mut config_buf),
    )?;
    let configuration =
        ParsedConfiguration::parse(&config_buf[..n]).ok_or(UsbError::InvalidDescriptor)?;

    check(aborted)?;
    let langid = read_langid(hal, ctx, port, address);
    let manufacturer = read_string(hal, ctx, port, address, descriptor.iManufacturer, langid);
    let product = read_string(hal, ctx, port, address, descriptor.iProduct, langid);
    let serial_number = read_string(hal, ctx, port, address, descriptor.iSerialNumber, langid);

    check(aborted)?;
    let value = configuration.descriptor.bConfigurationValue;
    hal.control_transfer(
        ctx,
        port,
        address,
        SetupPacket {
            bmRequestType: HOST_TO_DEVICE,
            bRequest: SET_CONFIGURATION,
            wValue: value as u16,
            wIndex: 0,
            wLength: 0,
        },
        DataPhase::None,
    )?;
    debug!(
        "port {port}: device {:04x}:{:04x} configured, value {value}",
        descriptor.vid(),
        descriptor.pid()
    );

    Ok(HostDevice::new(
        address,
        port,
        speed,
        max_packet_size_ep0,
        descriptor,
        configuration,
        manufacturer,
        product,
        serial_number,
    ))
}

/// Pick a language ID for string reads: US English when offered,
/// otherwise whatever the device lists first.
fn read_langid<H: HostHal>(hal: &H, ctx: &Context, port: u8, address: u8) -> u16 {
    let mut buf = [0u8; 64];
    let result = hal.control_transfer(
        ctx,
        port,
        address,
        get_descriptor_setup(wire::STRING_DESCRIPTOR, 0, 0, buf.len() as u16),
        DataPhase::In(&mut buf),
    );
    match result {
        Ok(n) => match wire::parse_langid_descriptor(&buf[..n]) {
            Ok((ids, _)) if ids.contains(&wire::LANGID_EN_US) => wire::LANGID_EN_US,
            Ok((ids, _)) => ids.first().copied().unwrap_or(wire::LANGID_EN_US),
            Err(_) => wire::LANGID_EN_US,
        },
        Err(_) => wire::LANGID_EN_US,
    }
}

/// Read one string descriptor, ASCII-projected. String failures never
/// abort enumeration.
fn read_string<H: HostHal>(
    hal: &H,
    ctx: &Context,
    port: u8,
    address: u8,
    index: u8,
    langid: u16,
) -> Option<String> {
    if index == 0 {
        return None;
    }
    let mut buf = [0u8; 255];
    let result = hal.control_transfer(
        ctx,
        port,
        address,
        get_descriptor_setup(wire::STRING_DESCRIPTOR, index, langid, buf.len() as u16),
        DataPhase::In(&mut buf),
    );
    match result {
        Ok(n) => match wire::parse_string_descriptor(&buf[..n]) {
            Ok((s, _)) => Some(s),
            Err(e) => {
                warn!("port {port}: string {index} unparseable: {e}");
                None
            }
        },
        Err(e) => {
            warn!("port {port}: string {index} read failed: {e}");
            None
        }
    }
}
