//! The error taxonomy shared by every crate in the stack.

use std::fmt;

/// Everything that can go wrong in the stack, as values.
///
/// Protocol-level conditions (`Stall`, `Nak`, `Reset`) are ordinary
/// variants because both cores route on them; transport failures carry
/// their syscall-level cause in [`TransportError`].
#[derive(Debug)]
pub enum UsbError {
    /// A caller-provided output buffer cannot hold the result.
    BufferTooSmall,
    /// Input bytes end before the length they claim.
    ShortBuffer,
    /// A descriptor (or descriptor tree under construction) is invalid.
    InvalidDescriptor,
    /// The addressed endpoint does not exist in the active configuration.
    InvalidEndpoint,
    /// A request is malformed or not meaningful for its recipient.
    InvalidRequest,
    /// The operation needs a configured device.
    NotConfigured,
    /// The stack has not been started.
    NotRunning,
    /// The stack is already running.
    AlreadyRunning,
    /// The addressed device is gone.
    NoDevice,
    /// A fixed-size pool is exhausted.
    NoMemory,
    /// The endpoint answered with a STALL handshake.
    Stall,
    /// The endpoint answered with a NAK handshake.
    Nak,
    /// The operation's cancellation context fired.
    Cancelled,
    /// A bus reset interrupted the operation.
    Reset,
    /// The transport cannot perform this operation.
    NotSupported,
    /// The peer violated the wire protocol.
    Protocol,
    /// The resource is busy with another operation.
    Busy,
    /// An I/O failure in the transport, with context.
    Transport(TransportError),
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall => f.write_str("buffer too small"),
            Self::ShortBuffer => f.write_str("input shorter than claimed length"),
            Self::InvalidDescriptor => f.write_str("invalid descriptor"),
            Self::InvalidEndpoint => f.write_str("no such endpoint"),
            Self::InvalidRequest => f.write_str("invalid request"),
            Self::NotConfigured => f.write_str("device not configured"),
            Self::NotRunning => f.write_str("not running"),
            Self::AlreadyRunning => f.write_str("already running"),
            Self::NoDevice => f.write_str("no such device"),
            Self::NoMemory => f.write_str("pool exhausted"),
            Self::Stall => f.write_str("endpoint stalled"),
            Self::Nak => f.write_str("endpoint returned NAK"),
            Self::Cancelled => f.write_str("operation cancelled"),
            Self::Reset => f.write_str("interrupted by bus reset"),
            Self::NotSupported => f.write_str("not supported by this transport"),
            Self::Protocol => f.write_str("wire protocol violation"),
            Self::Busy => f.write_str("resource busy"),
            Self::Transport(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for UsbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(&e.source),
            _ => None,
        }
    }
}

impl From<TransportError> for UsbError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// A transport I/O error with enough context to tell which wire
/// operation failed, on which endpoint, for which device address.
#[derive(Debug)]
pub struct TransportError {
    pub operation: &'static str,
    pub endpoint: Option<u8>,
    pub address: Option<u8>,
    pub source: std::io::Error,
}

impl TransportError {
    pub fn new(operation: &'static str, source: std::io::Error) -> Self {
        Self {
            operation,
            endpoint: None,
            address: None,
            source,
        }
    }

    pub fn endpoint(mut self, endpoint: u8) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn address(mut self, address: u8) -> Self {
        self.address = Some(address);
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        if let Some(addr) = self.address {
            write!(f, " addr {addr}")?;
        }
        if let Some(ep) = self.endpoint {
            write!(f, " ep {ep:#04x}")?;
        }
        write!(f, ": {}", self.source)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Shorthand for wrapping an [`std::io::Error`] at a call site.
pub fn transport(operation: &'static str, source: std::io::Error) -> UsbError {
    UsbError::Transport(TransportError::new(operation, source))
}
