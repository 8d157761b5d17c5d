use super::*;
use crate::descriptors::{ConfigurationBuilder, DeviceBuilder, InterfaceBuilder};
use softusb_core::context::Context;
use softusb_core::device_hal::{DeviceHal, Ep0Event};
use softusb_core::error::UsbError;
use softusb_core::types::{DeviceState, EndpointType, UsbSpeed};
use softusb_core::wire::{self, SetupPacket};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Write(Vec<u8>),
    Ack,
    Stall,
}

/// Scripted transport: a queue of EP0 events in, a log of EP0 replies
/// out. `read_ep0` reports cancellation once the script is drained so
/// the servicing thread parks on the context.
struct FakeHal {
    events: Mutex<VecDeque<Ep0Event>>,
    actions: Mutex<Vec<Action>>,
    address: Mutex<u8>,
    speed: UsbSpeed,
}

impl FakeHal {
    fn new(speed: UsbSpeed) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            actions: Mutex::new(Vec::new()),
            address: Mutex::new(0),
            speed,
        }
    }

    fn push(&self, event: Ep0Event) {
        self.events.lock().unwrap().push_back(event);
    }

    fn wait_actions(&self, count: usize) -> Vec<Action> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let actions = self.actions.lock().unwrap();
                if actions.len() >= count {
                    return actions.clone();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for replies");
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl DeviceHal for FakeHal {
    fn init(&self) -> Result<(), UsbError> {
        Ok(())
    }

    fn connect(&self) -> Result<(), UsbError> {
        Ok(())
    }

    fn disconnect(&self) -> Result<(), UsbError> {
        Ok(())
    }

    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn read_ep0(&self, ctx: &Context) -> Result<Ep0Event, UsbError> {
        loop {
            ctx.check()?;
            if let Some(event) = self.events.lock().unwrap().pop_front() {
                return Ok(event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn write_ep0(&self, data: &[u8]) -> Result<(), UsbError> {
        self.actions.lock().unwrap().push(Action::Write(data.to_vec()));
        Ok(())
    }

    fn ack_ep0(&self) -> Result<(), UsbError> {
        self.actions.lock().unwrap().push(Action::Ack);
        Ok(())
    }

    fn stall_ep0(&self) -> Result<(), UsbError> {
        self.actions.lock().unwrap().push(Action::Stall);
        Ok(())
    }

    fn set_address(&self, address: u8) {
        *self.address.lock().unwrap() = address;
    }

    fn read_endpoint(
        &self,
        _ctx: &Context,
        _ep: u8,
        _buf: &mut [u8],
    ) -> Result<usize, UsbError> {
        Err(UsbError::NotSupported)
    }

    fn try_read_endpoint(&self, _ep: u8, _buf: &mut [u8]) -> Result<usize, UsbError> {
        Err(UsbError::Nak)
    }

    fn write_endpoint(
        &self,
        _ctx: &Context,
        _ep: u8,
        _data: &[u8],
    ) -> Result<(), UsbError> {
        Ok(())
    }
}

fn serial_tree() -> crate::descriptors::DescriptorTree {
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

fn setup(bm_request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
    SetupPacket {
        bmRequestType: bm_request_type,
        bRequest: request,
        wValue: value,
        wIndex: index,
        wLength: length,
    }
}

fn get_descriptor(descriptor_type: u8, index: u8, length: u16) -> Ep0Event {
    Ep0Event::Setup(
        setup(
            wire::DEVICE_TO_HOST,
            wire::GET_DESCRIPTOR,
            ((descriptor_type as u16) << 8) | index as u16,
            0,
            length,
        ),
        None,
    )
}

#[test]
fn enumeration_request_sequence() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());

    hal.push(Ep0Event::Reset);
    hal.push(get_descriptor(wire::DEVICE_DESCRIPTOR, 0, 8));
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_ADDRESS, 5, 0, 0),
        None,
    ));
    hal.push(get_descriptor(wire::DEVICE_DESCRIPTOR, 0, 18));
    hal.push(get_descriptor(wire::CONFIGURATION_DESCRIPTOR, 0, 9));
    hal.push(get_descriptor(wire::CONFIGURATION_DESCRIPTOR, 0, 512));
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_CONFIGURATION, 1, 0, 0),
        None,
    ));
    device.start().unwrap();

    let actions = hal.wait_actions(6);
    // Short read returns exactly wLength bytes.
    assert_eq!(actions[0], {
        let mut full = [0u8; 18];
        serial_tree().device_descriptor().write_to(&mut full);
        Action::Write(full[..8].to_vec())
    });
    assert_eq!(actions[1], Action::Ack); // SET_ADDRESS
    match &actions[2] {
        Action::Write(bytes) => assert_eq!(bytes.len(), 18),
        other => panic!("expected full descriptor, got {other:?}"),
    }
    match &actions[3] {
        Action::Write(bytes) => {
            assert_eq!(bytes.len(), 9);
            let (cfg, _) = wire::ConfigurationDescriptor::parse(bytes).unwrap();
            assert_eq!(cfg.bConfigurationValue, 1);
            assert_eq!(cfg.bNumInterfaces, 2);
        }
        other => panic!("expected configuration header, got {other:?}"),
    }
    match &actions[4] {
        Action::Write(bytes) => {
            let (cfg, _) = wire::ConfigurationDescriptor::parse(bytes).unwrap();
            assert_eq!(bytes.len(), cfg.total_length() as usize);
        }
        other => panic!("expected full configuration, got {other:?}"),
    }
    assert_eq!(actions[5], Action::Ack); // SET_CONFIGURATION

    assert_eq!(device.state(), DeviceState::Configured);
    assert_eq!(device.address(), 5);
    assert_eq!(device.configuration_value(), 1);
    assert_eq!(*hal.address.lock().unwrap(), 5);

    device.stop().unwrap();
    assert_eq!(device.state(), DeviceState::Detached);
}

#[test]
fn configured_requires_address_first() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());

    hal.push(Ep0Event::Reset);
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_CONFIGURATION, 1, 0, 0),
        None,
    ));
    device.start().unwrap();

    let actions = hal.wait_actions(1);
    assert_eq!(actions[0], Action::Stall);
    assert_eq!(device.state(), DeviceState::Default);
    device.stop().unwrap();
}

#[test]
fn bus_reset_returns_to_default() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());

    hal.push(Ep0Event::Reset);
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_ADDRESS, 7, 0, 0),
        None,
    ));
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_CONFIGURATION, 1, 0, 0),
        None,
    ));
    device.start().unwrap();
    hal.wait_actions(2);
    assert_eq!(device.state(), DeviceState::Configured);

    hal.push(Ep0Event::Reset);
    let deadline = Instant::now() + Duration::from_secs(2);
    while device.state() != DeviceState::Default {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(device.address(), 0);
    assert!(matches!(
        device.endpoint(0x81),
        Err(UsbError::NotConfigured)
    ));
    device.stop().unwrap();
}

#[test]
fn endpoint_halt_feature() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());

    hal.push(Ep0Event::Reset);
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_ADDRESS, 1, 0, 0),
        None,
    ));
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_CONFIGURATION, 1, 0, 0),
        None,
    ));
    hal.push(Ep0Event::Setup(
        setup(
            wire::HOST_TO_DEVICE | wire::RECIPIENT_ENDPOINT,
            wire::SET_FEATURE,
            wire::FEATURE_ENDPOINT_HALT,
            0x82,
            0,
        ),
        None,
    ));
    hal.push(Ep0Event::Setup(
        setup(
            wire::DEVICE_TO_HOST | wire::RECIPIENT_ENDPOINT,
            wire::GET_STATUS,
            0,
            0x82,
            2,
        ),
        None,
    ));
    hal.push(Ep0Event::Setup(
        setup(
            wire::HOST_TO_DEVICE | wire::RECIPIENT_ENDPOINT,
            wire::CLEAR_FEATURE,
            wire::FEATURE_ENDPOINT_HALT,
            0x82,
            0,
        ),
        None,
    ));
    hal.push(Ep0Event::Setup(
        setup(
            wire::DEVICE_TO_HOST | wire::RECIPIENT_ENDPOINT,
            wire::GET_STATUS,
            0,
            0x82,
            2,
        ),
        None,
    ));
    device.start().unwrap();

    let actions = hal.wait_actions(6);
    assert_eq!(actions[2], Action::Ack); // SET_FEATURE
    assert_eq!(actions[3], Action::Write(vec![1, 0]));
    assert_eq!(actions[4], Action::Ack); // CLEAR_FEATURE
    assert_eq!(actions[5], Action::Write(vec![0, 0]));
    device.stop().unwrap();
}

#[test]
fn device_qualifier_full_speed_stalls() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());
    hal.push(Ep0Event::Reset);
    hal.push(get_descriptor(wire::DEVICE_QUALIFIER_DESCRIPTOR, 0, 10));
    device.start().unwrap();
    assert_eq!(hal.wait_actions(1)[0], Action::Stall);
    device.stop().unwrap();
}

#[test]
fn device_qualifier_high_speed_answers() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::High480));
    let device = Device::new(hal.clone(), serial_tree());
    hal.push(Ep0Event::Reset);
    hal.push(get_descriptor(wire::DEVICE_QUALIFIER_DESCRIPTOR, 0, 10));
    device.start().unwrap();
    match &hal.wait_actions(1)[0] {
        Action::Write(bytes) => assert_eq!(bytes.len(), 10),
        other => panic!("expected qualifier, got {other:?}"),
    }
    device.stop().unwrap();
}

#[test]
fn string_requests() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());
    hal.push(Ep0Event::Reset);
    hal.push(get_descriptor(wire::STRING_DESCRIPTOR, 0, 255));
    hal.push(get_descriptor(wire::STRING_DESCRIPTOR, 2, 255));
    hal.push(get_descriptor(wire::STRING_DESCRIPTOR, 9, 255));
    device.start().unwrap();

    let actions = hal.wait_actions(3);
    match &actions[0] {
        Action::Write(bytes) => {
            let (ids, _) = wire::parse_langid_descriptor(bytes).unwrap();
            assert_eq!(ids, vec![wire::LANGID_EN_US]);
        }
        other => panic!("expected language ids, got {other:?}"),
    }
    match &actions[1] {
        Action::Write(bytes) => {
            let (s, _) = wire::parse_string_descriptor(bytes).unwrap();
            assert_eq!(s, "CDC-ACM Serial Port");
        }
        other => panic!("expected product string, got {other:?}"),
    }
    assert_eq!(actions[2], Action::Stall); // no string index 9
    device.stop().unwrap();
}

struct CountingDriver {
    inited: AtomicUsize,
    fail_setup: AtomicBool,
}

impl CountingDriver {
    fn new() -> Self {
        Self {
            inited: AtomicUsize::new(0),
            fail_setup: AtomicBool::new(false),
        }
    }
}

impl crate::class::ClassDriver for CountingDriver {
    fn init(&self, _iface: &crate::class::InterfaceContext) -> Result<(), UsbError> {
        self.inited.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle_setup(
        &self,
        _iface: &crate::class::InterfaceContext,
        setup: &SetupPacket,
        _out_data: Option<&[u8]>,
        reply: &mut [u8],
    ) -> Result<crate::class::SetupReply, UsbError> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(UsbError::InvalidRequest);
        }
        match setup.bRequest {
            0x21 => {
                reply[..2].copy_from_slice(&[0xAB, 0xCD]);
                Ok(crate::class::SetupReply::InData(2))
            }
            0x22 => Ok(crate::class::SetupReply::Ack),
            _ => Ok(crate::class::SetupReply::NotHandled),
        }
    }

    fn set_alternate(
        &self,
        _iface: &crate::class::InterfaceContext,
        _alternate: u8,
    ) -> Result<(), UsbError> {
        Ok(())
    }

    fn close(&self) -> Result<(), UsbError> {
        Ok(())
    }
}

#[test]
fn class_request_routing_and_stall_recovery() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());
    let driver = Arc::new(CountingDriver::new());
    device.bind_class_driver(1, 0, driver.clone()).unwrap();

    hal.push(Ep0Event::Reset);
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_ADDRESS, 1, 0, 0),
        None,
    ));
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_CONFIGURATION, 1, 0, 0),
        None,
    ));
    // Class IN request handled by the driver.
    hal.push(Ep0Event::Setup(
        setup(
            wire::DEVICE_TO_HOST | wire::CLASS_REQUEST | wire::RECIPIENT_INTERFACE,
            0x21,
            0,
            0,
            2,
        ),
        None,
    ));
    // Unrecognized class request: driver says NotHandled, core stalls.
    hal.push(Ep0Event::Setup(
        setup(
            wire::HOST_TO_DEVICE | wire::CLASS_REQUEST | wire::RECIPIENT_INTERFACE,
            0x7F,
            0,
            0,
            0,
        ),
        None,
    ));
    // The stall is per-request: the next one is serviced normally.
    hal.push(Ep0Event::Setup(
        setup(
            wire::HOST_TO_DEVICE | wire::CLASS_REQUEST | wire::RECIPIENT_INTERFACE,
            0x22,
            0,
            0,
            0,
        ),
        None,
    ));
    device.start().unwrap();

    let actions = hal.wait_actions(5);
    assert_eq!(driver.inited.load(Ordering::SeqCst), 1);
    assert_eq!(actions[2], Action::Write(vec![0xAB, 0xCD]));
    assert_eq!(actions[3], Action::Stall);
    assert_eq!(actions[4], Action::Ack);
    device.stop().unwrap();
}

#[test]
fn driver_error_stalls_only_that_request() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());
    let driver = Arc::new(CountingDriver::new());
    device.bind_class_driver(1, 0, driver.clone()).unwrap();

    hal.push(Ep0Event::Reset);
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_ADDRESS, 1, 0, 0),
        None,
    ));
    hal.push(Ep0Event::Setup(
        setup(wire::HOST_TO_DEVICE, wire::SET_CONFIGURATION, 1, 0, 0),
        None,
    ));
    device.start().unwrap();
    hal.wait_actions(2);

    driver.fail_setup.store(true, Ordering::SeqCst);
    hal.push(Ep0Event::Setup(
        setup(
            wire::HOST_TO_DEVICE | wire::CLASS_REQUEST | wire::RECIPIENT_INTERFACE,
            0x22,
            0,
            0,
            0,
        ),
        None,
    ));
    let actions = hal.wait_actions(3);
    assert_eq!(actions[2], Action::Stall);

    driver.fail_setup.store(false, Ordering::SeqCst);
    hal.push(Ep0Event::Setup(
        setup(
            wire::HOST_TO_DEVICE | wire::CLASS_REQUEST | wire::RECIPIENT_INTERFACE,
            0x22,
            0,
            0,
            0,
        ),
        None,
    ));
    let actions = hal.wait_actions(4);
    assert_eq!(actions[3], Action::Ack);
    device.stop().unwrap();
}

#[test]
fn start_twice_is_an_error() {
    let hal = Arc::new(FakeHal::new(UsbSpeed::Full12));
    let device = Device::new(hal.clone(), serial_tree());
    device.start().unwrap();
    assert!(matches!(device.start(), Err(UsbError::AlreadyRunning)));
    device.stop().unwrap();
    assert!(matches!(device.stop(), Err(UsbError::NotRunning)));
}
