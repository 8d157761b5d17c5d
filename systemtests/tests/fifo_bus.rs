//! End-to-end scenarios over a real pipe bus: device stack and host
//! stack in one process, wired through the shared bus directory
//! exactly as two separate processes would be.

use softusb_core::context::Context;
use softusb_core::error::UsbError;
use softusb_core::host_hal::DataPhase;
use softusb_core::types::DeviceState;
use softusb_core::wire::{self, SetupPacket};
use softusb_device::Device;
use softusb_hal_fifo::{FifoDeviceHal, FifoHostHal};
use softusb_host::Host;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use systemtests::{
    keyboard_device_tree, scratch_bus_dir, serial_device_tree, shared, EchoDriver,
    KeyboardDriver, RefusingDriver, HELLO_KEYSTROKES,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_host(bus: &std::path::Path) -> Host<FifoHostHal> {
    let host = Host::new(Arc::new(FifoHostHal::new(bus)));
    host.start().unwrap();
    host
}

#[test]
fn cdc_acm_echo() {
    init_logging();
    let bus = scratch_bus_dir();

    let device = Device::new(
        Arc::new(FifoDeviceHal::new(&bus)),
        serial_device_tree(),
    );
    let echo = shared(EchoDriver::new());
    device.bind_class_driver(1, 0, echo.clone()).unwrap();
    device.bind_class_driver(1, 1, echo).unwrap();
    device.start().unwrap();

    let host = start_host(&bus);
    let ctx = Context::with_timeout(Duration::from_secs(10));
    let record = host.wait_device(&ctx).unwrap();
    assert_eq!(record.descriptor.vid(), 0x1234);
    assert_eq!(record.descriptor.pid(), 0x5678);
    assert_eq!(record.manufacturer.as_deref(), Some("SoftUSB Example"));
    assert_eq!(record.product.as_deref(), Some("CDC-ACM Serial Port"));
    assert_eq!(record.serial_number.as_deref(), Some("12345678"));
    assert_eq!(record.configuration.interfaces.len(), 2);
    assert_eq!(record.state(), DeviceState::Configured);
    assert_eq!(device.state(), DeviceState::Configured);

    let payload = b"Hello from USB Host!";
    assert_eq!(payload.len(), 20);
    let sent = host
        .bulk_transfer(&ctx, &record, 0x02, DataPhase::Out(payload))
        .unwrap();
    assert_eq!(sent, payload.len());

    let mut buf = [0u8; 64];
    let received = host
        .bulk_transfer(&ctx, &record, 0x82, DataPhase::In(&mut buf))
        .unwrap();
    assert_eq!(&buf[..received], payload);

    host.stop().unwrap();
    device.stop().unwrap();
    let _ = std::fs::remove_dir_all(&bus);
}

#[test]
fn cdc_acm_class_requests() {
    init_logging();
    let bus = scratch_bus_dir();

    let device = Device::new(
        Arc::new(FifoDeviceHal::new(&bus)),
        serial_device_tree(),
    );
    let echo = shared(EchoDriver::new());
    device.bind_class_driver(1, 0, echo.clone()).unwrap();
    device.bind_class_driver(1, 1, echo).unwrap();
    device.start().unwrap();

    let host = start_host(&bus);
    let ctx = Context::with_timeout(Duration::from_secs(10));
    let record = host.wait_device(&ctx).unwrap();

    // SET_LINE_CODING (9600 8N1), then read it back.
    let coding = [0x80, 0x25, 0x00, 0x00, 0x00, 0x00, 0x08];
    host.control_transfer(
        &ctx,
        &record,
        SetupPacket {
            bmRequestType: wire::HOST_TO_DEVICE
                | wire::CLASS_REQUEST
                | wire::RECIPIENT_INTERFACE,
            bRequest: 0x20,
            wValue: 0,
            wIndex: 0,
            wLength: coding.len() as u16,
        },
        DataPhase::Out(&coding),
    )
    .unwrap();

    let mut readback = [0u8; 7];
    let n = host
        .control_transfer(
            &ctx,
            &record,
            SetupPacket {
                bmRequestType: wire::DEVICE_TO_HOST
                    | wire::CLASS_REQUEST
                    | wire::RECIPIENT_INTERFACE,
                bRequest: 0x21,
                wValue: 0,
                wIndex: 0,
                wLength: 7,
            },
            DataPhase::In(&mut readback),
        )
        .unwrap();
    assert_eq!(n, 7);
    assert_eq!(readback, coding);

    host.stop().unwrap();
    device.stop().unwrap();
    let _ = std::fs::remove_dir_all(&bus);
}

#[test]
fn hid_keyboard_types_hello() {
    init_logging();
    let bus = scratch_bus_dir();

    let device = Device::new(
        Arc::new(FifoDeviceHal::new(&bus)),
        keyboard_device_tree(),
    );
    device
        .bind_class_driver(1, 0, shared(KeyboardDriver::new(Duration::from_millis(100))))
        .unwrap();
    device.start().unwrap();

    let host = start_host(&bus);
    let ctx = Context::with_timeout(Duration::from_secs(30));
    let record = host.wait_device(&ctx).unwrap();
    assert_eq!(record.descriptor.pid(), 0x5679);
    let hid_iface = &record.configuration.interfaces[0];
    assert_eq!(hid_iface.descriptor.bInterfaceClass, 0x03);
    // The HID descriptor came back verbatim with its owning interface.
    assert_eq!(hid_iface.class_descriptors.len(), 1);
    assert_eq!(hid_iface.class_descriptors[0][1], 0x21);

    let mut reports = Vec::new();
    while reports.len() < 12 {
        let mut buf = [0u8; 8];
        let n = host
            .interrupt_transfer(&ctx, &record, 0x81, DataPhase::In(&mut buf))
            .unwrap();
        assert_eq!(n, 8);
        reports.push(buf);
    }

    for (i, (modifier, keycode)) in HELLO_KEYSTROKES.iter().enumerate() {
        let press = reports[i * 2];
        let release = reports[i * 2 + 1];
        assert_eq!((press[0], press[2]), (*modifier, *keycode), "report {i}");
        assert_eq!(release, [0u8; 8], "release {i}");
    }

    host.stop().unwrap();
    device.stop().unwrap();
    let _ = std::fs::remove_dir_all(&bus);
}

#[test]
fn hotplug_two_devices_in_order() {
    init_logging();
    let bus = scratch_bus_dir();

    let serviced = Arc::new(AtomicUsize::new(0));
    let host = Host::new(Arc::new(FifoHostHal::new(&bus)));
    {
        let serviced = serviced.clone();
        host.set_on_device_connect(move |_| {
            serviced.fetch_add(1, Ordering::SeqCst);
        });
    }
    host.start().unwrap();
    let ctx = Context::with_timeout(Duration::from_secs(30));

    // Device A comes, is serviced, and goes.
    let hal_a = Arc::new(FifoDeviceHal::new(&bus));
    let uuid_a = hal_a.uuid();
    let device_a = Device::new(hal_a, serial_device_tree());
    let echo = shared(EchoDriver::new());
    device_a.bind_class_driver(1, 0, echo.clone()).unwrap();
    device_a.bind_class_driver(1, 1, echo).unwrap();
    device_a.start().unwrap();

    let record_a = host.wait_device(&ctx).unwrap();
    let port_a = record_a.port;
    device_a.stop().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !host.devices().is_empty() {
        assert!(Instant::now() < deadline, "device A never went away");
        std::thread::sleep(Duration::from_millis(10));
    }

    // Device B follows.
    let hal_b = Arc::new(FifoDeviceHal::new(&bus));
    let uuid_b = hal_b.uuid();
    let device_b = Device::new(hal_b, serial_device_tree());
    let echo = shared(EchoDriver::new());
    device_b.bind_class_driver(1, 0, echo.clone()).unwrap();
    device_b.bind_class_driver(1, 1, echo).unwrap();
    device_b.start().unwrap();

    let record_b = host.wait_device(&ctx).unwrap();
    assert_ne!(uuid_a, uuid_b);
    assert_ne!(port_a, record_b.port);
    assert_eq!(serviced.load(Ordering::SeqCst), 2);

    host.stop().unwrap();
    device_b.stop().unwrap();
    let _ = std::fs::remove_dir_all(&bus);
}

#[test]
fn short_descriptor_read_is_exact() {
    init_logging();
    let bus = scratch_bus_dir();

    let device = Device::new(
        Arc::new(FifoDeviceHal::new(&bus)),
        serial_device_tree(),
    );
    device.start().unwrap();

    let host = start_host(&bus);
    let ctx = Context::with_timeout(Duration::from_secs(10));
    let record = host.wait_device(&ctx).unwrap();

    // An 8-byte GET_DESCRIPTOR returns exactly 8 bytes...
    let mut buf = [0u8; 64];
    let n = host
        .control_transfer(
            &ctx,
            &record,
            SetupPacket {
                bmRequestType: wire::DEVICE_TO_HOST,
                bRequest: wire::GET_DESCRIPTOR,
                wValue: (wire::DEVICE_DESCRIPTOR as u16) << 8,
                wIndex: 0,
                wLength: 8,
            },
            DataPhase::In(&mut buf),
        )
        .unwrap();
    assert_eq!(n, 8);
    assert_eq!(buf[7], record.max_packet_size_ep0);

    // ...and the follow-up full read parses.
    let n = host
        .control_transfer(
            &ctx,
            &record,
            SetupPacket {
                bmRequestType: wire::DEVICE_TO_HOST,
                bRequest: wire::GET_DESCRIPTOR,
                wValue: (wire::DEVICE_DESCRIPTOR as u16) << 8,
                wIndex: 0,
                wLength: 18,
            },
            DataPhase::In(&mut buf),
        )
        .unwrap();
    assert_eq!(n, 18);
    let (full, _) = wire::DeviceDescriptor::parse(&buf[..n]).unwrap();
    assert_eq!(full.vid(), 0x1234);

    host.stop().unwrap();
    device.stop().unwrap();
    let _ = std::fs::remove_dir_all(&bus);
}

#[test]
fn stall_recovery_after_failing_class_request() {
    init_logging();
    let bus = scratch_bus_dir();

    let device = Device::new(
        Arc::new(FifoDeviceHal::new(&bus)),
        serial_device_tree(),
    );
    device
        .bind_class_driver(1, 0, shared(RefusingDriver))
        .unwrap();
    device.start().unwrap();

    let host = start_host(&bus);
    let ctx = Context::with_timeout(Duration::from_secs(10));
    let record = host.wait_device(&ctx).unwrap();

    // The class request stalls...
    let result = host.control_transfer(
        &ctx,
        &record,
        SetupPacket {
            bmRequestType: wire::HOST_TO_DEVICE
                | wire::CLASS_REQUEST
                | wire::RECIPIENT_INTERFACE,
            bRequest: 0x22,
            wValue: 0,
            wIndex: 0,
            wLength: 0,
        },
        DataPhase::None,
    );
    assert!(matches!(result, Err(UsbError::Stall)));

    // ...but the next SETUP is serviced normally: no persistent halt.
    let mut status = [0u8; 2];
    let n = host
        .control_transfer(
            &ctx,
            &record,
            SetupPacket {
                bmRequestType: wire::DEVICE_TO_HOST,
                bRequest: wire::GET_STATUS,
                wValue: 0,
                wIndex: 0,
                wLength: 2,
            },
            DataPhase::In(&mut status),
        )
        .unwrap();
    assert_eq!(n, 2);

    host.stop().unwrap();
    device.stop().unwrap();
    let _ = std::fs::remove_dir_all(&bus);
}

#[test]
fn wait_device_cancellation_on_idle_bus() {
    init_logging();
    let bus = scratch_bus_dir();
    let host = start_host(&bus);

    let started = Instant::now();
    let ctx = Context::with_timeout(Duration::from_millis(50));
    let result = host.wait_device(&ctx);
    assert!(matches!(result, Err(UsbError::Cancelled)));
    assert!(started.elapsed() < Duration::from_millis(70));

    host.stop().unwrap();
    let _ = std::fs::remove_dir_all(&bus);
}

#[test]
fn endpoint_halt_round_trip_over_the_bus() {
    init_logging();
    let bus = scratch_bus_dir();

    let device = Device::new(
        Arc::new(FifoDeviceHal::new(&bus)),
        serial_device_tree(),
    );
    device.start().unwrap();

    let host = start_host(&bus);
    let ctx = Context::with_timeout(Duration::from_secs(10));
    let record = host.wait_device(&ctx).unwrap();

    let set_halt = SetupPacket {
        bmRequestType: wire::HOST_TO_DEVICE | wire::RECIPIENT_ENDPOINT,
        bRequest: wire::SET_FEATURE,
        wValue: wire::FEATURE_ENDPOINT_HALT,
        wIndex: 0x82,
        wLength: 0,
    };
    host.control_transfer(&ctx, &record, set_halt, DataPhase::None)
        .unwrap();

    let mut status = [0u8; 2];
    host.control_transfer(
        &ctx,
        &record,
        SetupPacket {
            bmRequestType: wire::DEVICE_TO_HOST | wire::RECIPIENT_ENDPOINT,
            bRequest: wire::GET_STATUS,
            wValue: 0,
            wIndex: 0x82,
            wLength: 2,
        },
        DataPhase::In(&mut status),
    )
    .unwrap();
    assert_eq!(status, [1, 0]);

    host.control_transfer(
        &ctx,
        &record,
        SetupPacket {
            bmRequestType: wire::HOST_TO_DEVICE | wire::RECIPIENT_ENDPOINT,
            bRequest: wire::CLEAR_FEATURE,
            wValue: wire::FEATURE_ENDPOINT_HALT,
            wIndex: 0x82,
            wLength: 0,
        },
        DataPhase::None,
    )
    .unwrap();

    host.control_transfer(
        &ctx,
        &record,
        SetupPacket {
            bmRequestType: wire::DEVICE_TO_HOST | wire::RECIPIENT_ENDPOINT,
            bRequest: wire::GET_STATUS,
            wValue: 0,
            wIndex: 0x82,
            wLength: 2,
        },
        DataPhase::In(&mut status),
    )
    .unwrap();
    assert_eq!(status, [0, 0]);

    host.stop().unwrap();
    device.stop().unwrap();
    let _ = std::fs::remove_dir_all(&bus);
}
