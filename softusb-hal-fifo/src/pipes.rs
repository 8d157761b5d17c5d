//! Non-blocking FIFO plumbing shared by the two sides.
//!
//! Every FIFO is opened read-write so neither side ever sees EOF just
//! because the peer has not arrived yet. All blocking is implemented as
//! short-interval polls over non-blocking descriptors, which is how the
//! cancellation contexts get observed within their bound.

use crate::message::{self, MessageType, HEADER_SIZE, MAX_PAYLOAD};
use softusb_core::context::Context;
use softusb_core::error::{transport, UsbError};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Poll interval for blocked reads and writes.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Create the FIFO if it does not exist yet.
pub(crate) fn create_fifo(path: &Path) -> Result<(), UsbError> {
    match nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o644)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(transport(
            "mkfifo",
            std::io::Error::from_raw_os_error(e as i32),
        )),
    }
}

/// Open a FIFO read-write, non-blocking.
pub(crate) fn open_fifo(path: &Path) -> Result<Arc<File>, UsbError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map(Arc::new)
        .map_err(|e| transport("open fifo", e))
}

/// Read exactly `buf.len()` bytes, polling until the context fires.
fn read_exact(file: &File, ctx: &Context, buf: &mut [u8]) -> Result<(), UsbError> {
    let mut filled = 0;
    while filled < buf.len() {
        ctx.check()?;
        match (&*file).read(&mut buf[filled..]) {
            Ok(0) => std::thread::sleep(POLL_INTERVAL),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(transport("fifo read", e)),
        }
    }
    Ok(())
}

/// Write all of `buf`, polling while the pipe is full.
fn write_all(file: &File, ctx: &Context, buf: &[u8]) -> Result<(), UsbError> {
    let mut written = 0;
    while written < buf.len() {
        ctx.check()?;
        match (&*file).write(&buf[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(transport("fifo write", e)),
        }
    }
    Ok(())
}

/// Write one framed message. The payload may be split across slices
/// (the SETUP message prepends an address byte to the packet).
pub(crate) fn write_message(
    file: &File,
    ctx: &Context,
    message_type: MessageType,
    payload: &[&[u8]],
) -> Result<(), UsbError> {
    let length: usize = payload.iter().map(|p| p.len()).sum();
    if length > MAX_PAYLOAD {
        return Err(UsbError::BufferTooSmall);
    }
    write_all(file, ctx, &message::encode_header(message_type, length))?;
    for part in payload {
        write_all(file, ctx, part)?;
    }
    Ok(())
}

/// Read one framed message into `scratch`, blocking until the context
/// fires. Returns the type and payload length.
pub(crate) fn read_message(
    file: &File,
    ctx: &Context,
    scratch: &mut [u8],
) -> Result<(MessageType, usize), UsbError> {
    debug_assert!(scratch.len() >= MAX_PAYLOAD);
    let mut header = [0u8; HEADER_SIZE];
    read_exact(file, ctx, &mut header)?;
    let (message_type, length) = message::decode_header(&header)?;
    // The header is in; the sender is committed to the payload, so the
    // rest reads under the same context.
    read_exact(file, ctx, &mut scratch[..length])?;
    Ok((message_type, length))
}

/// Like [`read_message`], but gives up immediately when not even a
/// header byte is waiting. Used for NAK-style non-blocking reads.
pub(crate) fn try_read_message(
    file: &File,
    scratch: &mut [u8],
) -> Result<Option<(MessageType, usize)>, UsbError> {
    let mut first = [0u8; 1];
    match (&*file).read(&mut first) {
        Ok(1) => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(transport("fifo read", e)),
    }
    // Committed: the rest of the header and the payload follow shortly.
    let ctx = Context::with_timeout(Duration::from_millis(100));
    let mut rest = [0u8; HEADER_SIZE - 1];
    read_exact(file, &ctx, &mut rest)?;
    let header = [first[0], rest[0], rest[1]];
    let (message_type, length) = message::decode_header(&header)?;
    read_exact(file, &ctx, &mut scratch[..length])?;
    Ok(Some((message_type, length)))
}
