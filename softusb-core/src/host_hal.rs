//! The port-level I/O contract the host core drives.

use crate::context::Context;
use crate::error::UsbError;
use crate::types::UsbSpeed;
use crate::wire::SetupPacket;
use std::sync::mpsc::SyncSender;

/// Root-port hotplug events, delivered on the channel handed to
/// [`HostHal::start`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortEvent {
    Connect { port: u8, speed: UsbSpeed },
    Disconnect { port: u8 },
}

/// The data phase of a transfer, if any.
pub enum DataPhase<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    None,
}

impl DataPhase<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
            Self::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host-side hardware abstraction.
///
/// Transfers are routed by `port` (the physical identity of the device
/// on this transport) and additionally carry the bus `address` the host
/// core has assigned, because that is what travels on the wire. A
/// transport that performs its own addressing (usbfs does) may treat
/// [`HostHal::assign_address`] as bookkeeping only.
pub trait HostHal: Send + Sync {
    /// Bring up transport resources.
    fn init(&self) -> Result<(), UsbError>;

    /// Enable the root hub: start delivering [`PortEvent`]s on `events`.
    fn start(&self, events: SyncSender<PortEvent>) -> Result<(), UsbError>;

    /// Stop event delivery and release transport resources.
    fn stop(&self);

    /// Reset the given port and wait for the device to return to its
    /// default state.
    fn reset_port(&self, ctx: &Context, port: u8) -> Result<(), UsbError>;

    /// Record (and, where the transport needs it, communicate) the
    /// address assigned to the device on `port`.
    fn assign_address(&self, ctx: &Context, port: u8, address: u8) -> Result<(), UsbError>;

    /// A control transfer on the default pipe. Returns the number of
    /// data-phase bytes transferred.
    fn control_transfer(
        &self,
        ctx: &Context,
        port: u8,
        address: u8,
        setup: SetupPacket,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError>;

    /// A bulk transfer; direction comes from the endpoint address.
    fn bulk_transfer(
        &self,
        ctx: &Context,
        port: u8,
        address: u8,
        ep_address: u8,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError>;

    /// An interrupt transfer; direction comes from the endpoint address.
    fn interrupt_transfer(
        &self,
        ctx: &Context,
        port: u8,
        address: u8,
        ep_address: u8,
        data: DataPhase<'_>,
    ) -> Result<usize, UsbError>;
}
