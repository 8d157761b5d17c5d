//! Cooperative cancellation for blocking calls.
//!
//! Every externally observable blocking operation in the stack takes a
//! [`Context`]. The HALs implement their waits as short-deadline polls
//! (at most 100 ms per iteration), so a cancelled context unblocks the
//! caller within 200 ms with [`UsbError::Cancelled`].

use crate::error::UsbError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A deadline plus a cancellation flag, cheap to clone and pass down.
#[derive(Clone, Debug)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// A context with an explicit cancel handle and no deadline.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Self {
                cancelled: flag.clone(),
                deadline: None,
            },
            CancelHandle { flag },
        )
    }

    /// Derive a context sharing this one's cancellation flag but
    /// expiring no later than `timeout` from now.
    pub fn child_timeout(&self, timeout: Duration) -> Self {
        let child = Instant::now() + timeout;
        Self {
            cancelled: self.cancelled.clone(),
            deadline: Some(match self.deadline {
                Some(d) if d < child => d,
                _ => child,
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// `Err(Cancelled)` once the flag is set or the deadline has passed.
    pub fn check(&self) -> Result<(), UsbError> {
        if self.is_cancelled() {
            Err(UsbError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline,
    /// zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Cancels the contexts cloned from [`Context::with_cancel`].
#[derive(Clone, Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

#[cfg(test)]
#[path = "tests/context.rs"]
mod tests;
