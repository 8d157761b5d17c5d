//! The epoll worker: one mio `Poll` multiplexing the netlink socket,
//! a wakeup, and every open device descriptor.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) const WAKER_TOKEN: Token = Token(0);
pub(crate) const UEVENT_TOKEN: Token = Token(1);
pub(crate) const DEVICE_TOKEN_BASE: usize = 2;

pub(crate) fn device_token(slot: usize) -> Token {
    Token(DEVICE_TOKEN_BASE + slot)
}

pub(crate) fn device_slot(token: Token) -> Option<usize> {
    token.0.checked_sub(DEVICE_TOKEN_BASE)
}

/// Owns the worker thread; registrations go through the cloned
/// registry from any thread.
pub(crate) struct Poller {
    registry: Registry,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    /// Start the worker. `dispatch` runs on the worker thread for every
    /// ready token.
    pub fn spawn(
        mut dispatch: impl FnMut(Token) + Send + 'static,
    ) -> io::Result<Self> {
        let mut poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("softusb-usbfs-poll".into())
            .spawn(move || {
                let mut events = Events::with_capacity(64);
                loop {
                    if thread_stop.load(Ordering::Acquire) {
                        return;
                    }
                    match poll.poll(&mut events, Some(Duration::from_millis(100))) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::warn!("epoll worker: {e}");
                            return;
                        }
                    }
                    for event in events.iter() {
                        if event.token() != WAKER_TOKEN {
                            dispatch(event.token());
                        }
                    }
                }
            })?;

        Ok(Self {
            registry,
            waker,
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn register(
        &self,
        fd: RawFd,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.registry.register(&mut SourceFd(&fd), token, interests)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
