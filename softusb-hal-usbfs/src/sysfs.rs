//! Device discovery from `/sys/bus/usb/devices`.

use log::trace;
use softusb_core::types::UsbSpeed;
use std::path::{Path, PathBuf};

pub const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";
pub const DEVFS_ROOT: &str = "/dev/bus/usb";

/// One `<dev>:<cfg>.<iface>` interface node.
#[derive(Debug, Clone)]
pub struct SysfsInterface {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// One USB device as described by sysfs.
#[derive(Debug, Clone)]
pub struct SysfsDevice {
    /// Entry name, e.g. `1-4` or `2-1.3`.
    pub name: String,
    pub busnum: u8,
    pub devnum: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub speed: UsbSpeed,
    pub interfaces: Vec<SysfsInterface>,
}

impl SysfsDevice {
    /// The character-device path usbfs exposes for this device.
    pub fn devfs_path(&self, devfs_root: &Path) -> PathBuf {
        devfs_root.join(format!("{:03}", self.busnum)).join(format!("{:03}", self.devnum))
    }
}

/// Entries that are bus roots (`usb1`, ...) or interface nodes
/// (`1-4:1.0`) are not devices.
pub fn is_device_entry(name: &str) -> bool {
    !name.starts_with("usb") && !name.contains(':')
}

/// The sysfs `speed` attribute, in Mbit/s.
pub fn parse_speed(s: &str) -> Option<UsbSpeed> {
    match s.trim() {
        "1.5" => Some(UsbSpeed::Low1_1),
        "12" => Some(UsbSpeed::Full12),
        "480" => Some(UsbSpeed::High480),
        _ => None,
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_owned())
}

fn read_dec(dir: &Path, name: &str) -> Option<u8> {
    read_attr(dir, name)?.parse().ok()
}

fn read_hex_u16(dir: &Path, name: &str) -> Option<u16> {
    u16::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

fn read_hex_u8(dir: &Path, name: &str) -> Option<u8> {
    u8::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

/// Read one device entry; `None` when any required attribute is
/// missing (the entry is racing with removal, or is not a device).
pub fn read_device(root: &Path, name: &str) -> Option<SysfsDevice> {
    if !is_device_entry(name) {
        return None;
    }
    let dir = root.join(name);
    let busnum = read_dec(&dir, "busnum")?;
    let devnum = read_dec(&dir, "devnum")?;
    let vendor_id = read_hex_u16(&dir, "idVendor")?;
    let product_id = read_hex_u16(&dir, "idProduct")?;
    let device_class = read_hex_u8(&dir, "bDeviceClass")?;
    let speed = parse_speed(&read_attr(&dir, "speed")?)?;

    let mut interfaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let child = entry.file_name();
            let Some(child) = child.to_str() else { continue };
            // Interface nodes look like "<name>:<cfg>.<iface>".
            let Some(rest) = child.strip_prefix(name) else {
                continue;
            };
            let Some(rest) = rest.strip_prefix(':') else {
                continue;
            };
            let Some((_, iface)) = rest.split_once('.') else {
                continue;
            };
            let Ok(number) = iface.parse::<u8>() else {
                continue;
            };
            let idir = dir.join(child);
            interfaces.push(SysfsInterface {
                number,
                class: read_hex_u8(&idir, "bInterfaceClass").unwrap_or(0),
                subclass: read_hex_u8(&idir, "bInterfaceSubClass").unwrap_or(0),
                protocol: read_hex_u8(&idir, "bInterfaceProtocol").unwrap_or(0),
            });
        }
    }
    interfaces.sort_by_key(|i| i.number);

    Some(SysfsDevice {
        name: name.to_owned(),
        busnum,
        devnum,
        vendor_id,
        product_id,
        device_class,
        speed,
        interfaces,
    })
}

/// Enumerate every USB device sysfs currently knows about.
pub fn scan(root: &Path) -> Vec<SysfsDevice> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        trace!("{} unreadable", root.display());
        return found;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(device) = read_device(root, name) {
            found.push(device);
        }
    }
    found.sort_by_key(|d| (d.busnum, d.devnum));
    found
}

#[cfg(test)]
#[path = "tests/sysfs.rs"]
mod tests;
