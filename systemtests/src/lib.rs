//! Harness pieces for the integration scenarios: reference device
//! shapes (a CDC-ACM-style serial port, a HID boot keyboard) and the
//! class drivers that animate them over a real pipe bus.

use softusb_core::context::{CancelHandle, Context};
use softusb_core::error::UsbError;
use softusb_core::types::EndpointType;
use softusb_core::wire::SetupPacket;
use softusb_device::{
    ClassDriver, ConfigurationBuilder, DescriptorTree, DeviceBuilder, EndpointHandle,
    InterfaceBuilder, InterfaceContext, SetupReply,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A fresh bus directory under the system temp dir.
pub fn scratch_bus_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("softusb-bus-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// The serial-port-shaped device of the echo scenario.
pub fn serial_device_tree() -> DescriptorTree {
    DeviceBuilder::new(0x1234, 0x5678)
        .manufacturer("SoftUSB Example")
        .product("CDC-ACM Serial Port")
        .serial_number("12345678")
        .configuration(
            ConfigurationBuilder::new(1)
                .interface(
                    InterfaceBuilder::new(0)
                        .class(0x02, 0x02, 0x01)
                        .endpoint(0x81, EndpointType::Interrupt, 8, 10),
                )
                .interface(
                    InterfaceBuilder::new(1)
                        .class(0x0A, 0x00, 0x00)
                        .endpoint(0x82, EndpointType::Bulk, 64, 0)
                        .endpoint(0x02, EndpointType::Bulk, 64, 0),
                ),
        )
        .build()
        .unwrap()
}

/// Boot-protocol keyboard report descriptor (8-byte reports).
pub const KEYBOARD_REPORT_DESCRIPTOR: [u8; 63] = [
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15, 0x00,
    0x25, 0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02, 0x95, 0x01, 0x75, 0x08, 0x81, 0x01,
    0x95, 0x05, 0x75, 0x01, 0x05, 0x08, 0x19, 0x01, 0x29, 0x05, 0x91, 0x02, 0x95, 0x01,
    0x75, 0x03, 0x91, 0x01, 0x95, 0x06, 0x75, 0x08, 0x15, 0x00, 0x25, 0x65, 0x05, 0x07,
    0x19, 0x00, 0x29, 0x65, 0x81, 0x00, 0xC0,
];

/// The keyboard-shaped device of the HID scenario.
pub fn keyboard_device_tree() -> DescriptorTree {
    // HID descriptor referencing the report descriptor above.
    let hid_descriptor = [
        0x09,
        0x21,
        0x11,
        0x01,
        0x00,
        0x01,
        0x22,
        KEYBOARD_REPORT_DESCRIPTOR.len() as u8,
        0x00,
    ];
    DeviceBuilder::new(0x1234, 0x5679)
        .manufacturer("SoftUSB Example")
        .product("HID Keyboard")
        .serial_number("87654321")
        .configuration(
            ConfigurationBuilder::new(1).interface(
                InterfaceBuilder::new(0)
                    .class(0x03, 0x01, 0x01)
                    .class_descriptor(&hid_descriptor)
                    .endpoint(0x81, EndpointType::Interrupt, 8, 10),
            ),
        )
        .build()
        .unwrap()
}

/// Modifier/keycode pairs that type `"Hello\n"`, each followed by the
/// all-zero release report.
pub const HELLO_KEYSTROKES: [(u8, u8); 6] = [
    (0x02, 0x0B), // H (shifted)
    (0x00, 0x08), // e
    (0x00, 0x0F), // l
    (0x00, 0x0F), // l
    (0x00, 0x12), // o
    (0x00, 0x28), // Enter
];

/// A CDC-ACM-flavored driver: stores the line coding, echoes every
/// bulk-OUT payload back on the bulk-IN endpoint.
pub struct EchoDriver {
    line_coding: Mutex<[u8; 7]>,
    worker: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
}

impl EchoDriver {
    pub fn new() -> Self {
        Self {
            // 115200 8N1
            line_coding: Mutex::new([0x00, 0xC2, 0x01, 0x00, 0x00, 0x00, 0x08]),
            worker: Mutex::new(None),
        }
    }
}

impl Default for EchoDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassDriver for EchoDriver {
    fn init(&self, iface: &InterfaceContext) -> Result<(), UsbError> {
        // Only the data interface has the bulk pair to pump.
        let (Some(bulk_out), Some(bulk_in)) = (iface.endpoint(0x02), iface.endpoint(0x82))
        else {
            return Ok(());
        };
        let bulk_out: EndpointHandle = bulk_out.clone();
        let bulk_in: EndpointHandle = bulk_in.clone();
        let (ctx, cancel) = Context::with_cancel();
        let handle = std::thread::Builder::new()
            .name("echo-pump".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                loop {
                    if ctx.is_cancelled() {
                        return;
                    }
                    match bulk_out.try_read(&mut buf) {
                        Ok(n) => {
                            if bulk_in.write(&ctx, &buf[..n]).is_err() {
                                return;
                            }
                        }
                        Err(UsbError::Nak) => {
                            std::thread::sleep(Duration::from_millis(5))
                        }
                        Err(_) => std::thread::sleep(Duration::from_millis(20)),
                    }
                }
            })
            .map_err(|e| softusb_core::error::transport("spawn echo pump", e))?;
        *self.worker.lock().unwrap() = Some((cancel, handle));
        Ok(())
    }

    fn handle_setup(
        &self,
        _iface: &InterfaceContext,
        setup: &SetupPacket,
        out_data: Option<&[u8]>,
        reply: &mut [u8],
    ) -> Result<SetupReply, UsbError> {
        match setup.bRequest {
            // SET_LINE_CODING
            0x20 => {
                if let Some(data) = out_data {
                    let mut coding = self.line_coding.lock().unwrap();
                    let n = data.len().min(coding.len());
                    coding[..n].copy_from_slice(&data[..n]);
                }
                Ok(SetupReply::Ack)
            }
            // GET_LINE_CODING
            0x21 => {
                let coding = self.line_coding.lock().unwrap();
                reply[..coding.len()].copy_from_slice(&*coding);
                Ok(SetupReply::InData(coding.len()))
            }
            // SET_CONTROL_LINE_STATE
            0x22 => Ok(SetupReply::Ack),
            _ => Ok(SetupReply::NotHandled),
        }
    }

    fn set_alternate(
        &self,
        _iface: &InterfaceContext,
        _alternate: u8,
    ) -> Result<(), UsbError> {
        Ok(())
    }

    fn close(&self) -> Result<(), UsbError> {
        if let Some((cancel, handle)) = self.worker.lock().unwrap().take() {
            cancel.cancel();
            let _ = handle.join();
        }
        Ok(())
    }
}

/// A HID boot keyboard that types `"Hello\n"`: press/release report
/// pairs at a fixed cadence.
pub struct KeyboardDriver {
    interval: Duration,
    worker: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
}

impl KeyboardDriver {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            worker: Mutex::new(None),
        }
    }
}

impl ClassDriver for KeyboardDriver {
    fn init(&self, iface: &InterfaceContext) -> Result<(), UsbError> {
        let Some(interrupt_in) = iface.endpoint(0x81) else {
            return Ok(());
        };
        let interrupt_in = interrupt_in.clone();
        let interval = self.interval;
        let (ctx, cancel) = Context::with_cancel();
        let handle = std::thread::Builder::new()
            .name("keyboard-typist".into())
            .spawn(move || {
                for (modifier, keycode) in HELLO_KEYSTROKES {
                    for report in [
                        [modifier, 0, keycode, 0, 0, 0, 0, 0],
                        [0u8; 8], // release
                    ] {
                        if ctx.is_cancelled() {
                            return;
                        }
                        if interrupt_in.write(&ctx, &report).is_err() {
                            return;
                        }
                        std::thread::sleep(interval);
                    }
                }
            })
            .map_err(|e| softusb_core::error::transport("spawn typist", e))?;
        *self.worker.lock().unwrap() = Some((cancel, handle));
        Ok(())
    }

    fn handle_setup(
        &self,
        _iface: &InterfaceContext,
        setup: &SetupPacket,
        _out_data: Option<&[u8]>,
        _reply: &mut [u8],
    ) -> Result<SetupReply, UsbError> {
        match setup.bRequest {
            // SET_IDLE / SET_PROTOCOL
            0x0A | 0x0B => Ok(SetupReply::Ack),
            _ => Ok(SetupReply::NotHandled),
        }
    }

    fn set_alternate(
        &self,
        _iface: &InterfaceContext,
        _alternate: u8,
    ) -> Result<(), UsbError> {
        Ok(())
    }

    fn close(&self) -> Result<(), UsbError> {
        if let Some((cancel, handle)) = self.worker.lock().unwrap().take() {
            cancel.cancel();
            let _ = handle.join();
        }
        Ok(())
    }
}

/// A driver whose class requests always fail, for stall-recovery
/// scenarios.
pub struct RefusingDriver;

impl ClassDriver for RefusingDriver {
    fn init(&self, _iface: &InterfaceContext) -> Result<(), UsbError> {
        Ok(())
    }

    fn handle_setup(
        &self,
        _iface: &InterfaceContext,
        _setup: &SetupPacket,
        _out_data: Option<&[u8]>,
        _reply: &mut [u8],
    ) -> Result<SetupReply, UsbError> {
        Err(UsbError::InvalidRequest)
    }

    fn set_alternate(
        &self,
        _iface: &InterfaceContext,
        _alternate: u8,
    ) -> Result<(), UsbError> {
        Ok(())
    }

    fn close(&self) -> Result<(), UsbError> {
        Ok(())
    }
}

/// `Arc` a driver and hand it back twice for multi-interface binds.
pub fn shared<D: ClassDriver + 'static>(driver: D) -> Arc<D> {
    Arc::new(driver)
}
