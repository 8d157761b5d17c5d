//! The contract between the device core and pluggable class drivers.

use crate::endpoint::EndpointHandle;
use softusb_core::error::UsbError;
use softusb_core::wire::SetupPacket;

/// What a class driver did with a SETUP it was offered.
#[derive(Debug)]
pub enum SetupReply {
    /// The driver does not recognize the request; the core stalls EP0.
    NotHandled,
    /// IN data phase: the first `n` bytes of the reply buffer.
    InData(usize),
    /// No data phase (or OUT data consumed); acknowledge the status
    /// phase.
    Ack,
}

/// The view of one bound interface a class driver works through.
///
/// Endpoint handles stay valid for the lifetime of the configuration
/// episode they were issued in; drivers may clone them into their own
/// service threads.
#[derive(Debug, Clone)]
pub struct InterfaceContext {
    pub configuration_value: u8,
    pub number: u8,
    pub alternate: u8,
    pub endpoints: Vec<EndpointHandle>,
}

impl InterfaceContext {
    /// The interface's endpoint with the given address, if any.
    pub fn endpoint(&self, address: u8) -> Option<&EndpointHandle> {
        self.endpoints.iter().find(|e| e.address() == address)
    }
}

/// A class driver bound to one or more interfaces.
///
/// The core guarantees: `init` is called exactly once per (interface,
/// configuration episode) before any `handle_setup` for that interface;
/// `handle_setup` is never called concurrently for the same interface
/// (EP0 servicing is single-threaded); `close` is called once at device
/// teardown. A driver bound to several interfaces (CDC-ACM spans a
/// communications and a data interface) sees each lifecycle per
/// interface but `close` only once.
pub trait ClassDriver: Send + Sync {
    /// The interface's configuration has been selected.
    fn init(&self, iface: &InterfaceContext) -> Result<(), UsbError>;

    /// A class or vendor SETUP addressed to this interface.
    ///
    /// `out_data` carries the OUT data phase when the host sent one;
    /// an IN reply is written into `reply` and announced with
    /// [`SetupReply::InData`]. Errors stall EP0 for this request only.
    fn handle_setup(
        &self,
        iface: &InterfaceContext,
        setup: &SetupPacket,
        out_data: Option<&[u8]>,
        reply: &mut [u8],
    ) -> Result<SetupReply, UsbError>;

    /// The host selected an alternate setting for this interface.
    fn set_alternate(&self, iface: &InterfaceContext, alternate: u8) -> Result<(), UsbError>;

    /// The device stack is shutting down.
    fn close(&self) -> Result<(), UsbError>;
}
