//! Runtime endpoint handles given to class drivers.

use softusb_core::context::Context;
use softusb_core::device_hal::DeviceHal;
use softusb_core::error::UsbError;
use softusb_core::types::EndpointType;
use std::sync::{Arc, Mutex};

/// Mutable per-endpoint state, shared between the control-endpoint
/// servicing thread (halt feature requests) and the class-driver thread
/// using the endpoint.
#[derive(Debug, Default)]
pub(crate) struct EndpointState {
    pub halted: bool,
    pub data_toggle: bool,
    pub frame_number: u16,
}

/// A handle to one data endpoint of the active configuration.
///
/// Handles are cheap to clone; class drivers typically clone their IN
/// endpoint handle into a streaming thread. All I/O is refused with
/// [`UsbError::Stall`] while the endpoint is halted.
#[derive(Clone)]
pub struct EndpointHandle {
    hal: Arc<dyn DeviceHal>,
    address: u8,
    endpoint_type: EndpointType,
    max_packet_size: u16,
    state: Arc<Mutex<EndpointState>>,
}

impl EndpointHandle {
    pub(crate) fn new(
        hal: Arc<dyn DeviceHal>,
        address: u8,
        endpoint_type: EndpointType,
        max_packet_size: u16,
    ) -> Self {
        Self {
            hal,
            address,
            endpoint_type,
            max_packet_size,
            state: Arc::new(Mutex::new(EndpointState::default())),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().unwrap().halted
    }

    pub(crate) fn set_halted(&self, halted: bool) {
        let mut state = self.state.lock().unwrap();
        state.halted = halted;
        if !halted {
            // Clearing a halt resets the data toggle (USB 2.0 §9.4.5).
            state.data_toggle = false;
        }
    }

    pub(crate) fn frame_number(&self) -> u16 {
        self.state.lock().unwrap().frame_number
    }

    fn check_halt(&self) -> Result<(), UsbError> {
        if self.is_halted() {
            Err(UsbError::Stall)
        } else {
            Ok(())
        }
    }

    /// Blocking read from an OUT endpoint.
    pub fn read(&self, ctx: &Context, buf: &mut [u8]) -> Result<usize, UsbError> {
        self.check_halt()?;
        self.hal.read_endpoint(ctx, self.address, buf)
    }

    /// Non-blocking read from an OUT endpoint; `Nak` when nothing is
    /// waiting.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize, UsbError> {
        self.check_halt()?;
        self.hal.try_read_endpoint(self.address, buf)
    }

    /// Blocking write to an IN endpoint.
    pub fn write(&self, ctx: &Context, data: &[u8]) -> Result<(), UsbError> {
        self.check_halt()?;
        let mut state = self.state.lock().unwrap();
        self.hal.write_endpoint(ctx, self.address, data)?;
        state.data_toggle = !state.data_toggle;
        Ok(())
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("address", &self.address)
            .field("endpoint_type", &self.endpoint_type)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}
