//! Framing for the pipe transport: `type(1) | length(2, LE) | payload`.

use softusb_core::error::UsbError;

/// Frame header size on the wire.
pub const HEADER_SIZE: usize = 3;

/// Largest payload either side will frame or accept. Scratch buffers
/// are sized to this; nothing on the bus allocates per transfer.
pub const MAX_PAYLOAD: usize = 4096;

/// Message grammar of the pipe transport.
///
/// `Setup` carries `address(1) | setup packet(8) | optional OUT data`;
/// `Address` carries the newly assigned address byte; `Data` carries a
/// raw endpoint payload (zero length is a valid packet); the rest are
/// header-only handshakes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Setup = 0x01,
    Data = 0x02,
    Ack = 0x03,
    Nak = 0x04,
    Stall = 0x05,
    Reset = 0x12,
    Address = 0x13,
}

impl MessageType {
    pub fn from_wire(byte: u8) -> Result<Self, UsbError> {
        match byte {
            0x01 => Ok(Self::Setup),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::Ack),
            0x04 => Ok(Self::Nak),
            0x05 => Ok(Self::Stall),
            0x12 => Ok(Self::Reset),
            0x13 => Ok(Self::Address),
            _ => Err(UsbError::Protocol),
        }
    }
}

/// Encode a frame header.
pub fn encode_header(message_type: MessageType, length: usize) -> [u8; HEADER_SIZE] {
    debug_assert!(length <= MAX_PAYLOAD);
    let len = length as u16;
    [message_type as u8, len as u8, (len >> 8) as u8]
}

/// Decode a frame header; rejects unknown types and oversized lengths.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(MessageType, usize), UsbError> {
    let message_type = MessageType::from_wire(header[0])?;
    let length = u16::from_le_bytes([header[1], header[2]]) as usize;
    if length > MAX_PAYLOAD {
        return Err(UsbError::Protocol);
    }
    Ok((message_type, length))
}

#[cfg(test)]
#[path = "tests/message.rs"]
mod tests;
