//! The port-level I/O contract the device core drives.

use crate::context::Context;
use crate::error::UsbError;
use crate::types::UsbSpeed;
use crate::wire::SetupPacket;

/// What the default control endpoint delivered.
#[derive(Debug)]
pub enum Ep0Event {
    /// A SETUP packet, with the OUT data phase payload when the host
    /// sent one in the same transaction.
    Setup(SetupPacket, Option<Vec<u8>>),
    /// The host reset the bus.
    Reset,
}

/// Device-side hardware abstraction.
///
/// One implementation per transport. The device core calls `init` and
/// `connect` from `start`, then drives `read_ep0` from a dedicated
/// servicing thread; class drivers reach the data endpoints through the
/// endpoint handles the core builds over `read_endpoint` /
/// `write_endpoint`. Implementations are shared across threads and must
/// be internally synchronized.
pub trait DeviceHal: Send + Sync {
    /// Bring up the port-level resources.
    fn init(&self) -> Result<(), UsbError>;

    /// Signal attachment to the host (pull-up, connection byte, ...).
    fn connect(&self) -> Result<(), UsbError>;

    /// Signal detachment and release port resources.
    fn disconnect(&self) -> Result<(), UsbError>;

    /// Negotiated speed of the link.
    fn speed(&self) -> UsbSpeed;

    /// Block for the next event on the default control endpoint.
    fn read_ep0(&self, ctx: &Context) -> Result<Ep0Event, UsbError>;

    /// Write the IN data phase of the current control transfer.
    fn write_ep0(&self, data: &[u8]) -> Result<(), UsbError>;

    /// Complete the status phase with a zero-length acknowledgement.
    fn ack_ep0(&self) -> Result<(), UsbError>;

    /// Stall the current control transfer. The stall clears itself on
    /// the next SETUP.
    fn stall_ep0(&self) -> Result<(), UsbError>;

    /// Address to accept SETUPs for from now on (0 = any, pre-address).
    fn set_address(&self, address: u8);

    /// Blocking read from an OUT data endpoint. Returns bytes read.
    fn read_endpoint(
        &self,
        ctx: &Context,
        ep_address: u8,
        buf: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Non-blocking read from an OUT data endpoint; `Nak` when no data
    /// is waiting.
    fn try_read_endpoint(&self, ep_address: u8, buf: &mut [u8]) -> Result<usize, UsbError>;

    /// Blocking write to an IN data endpoint.
    fn write_endpoint(&self, ctx: &Context, ep_address: u8, data: &[u8])
        -> Result<(), UsbError>;
}
