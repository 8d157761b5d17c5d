//! Fixed-size URB pools, one per endpoint on an open device.
//!
//! Slots are boxed so the URB header and buffer addresses the kernel
//! holds stay put for the whole in-use window. The free list is
//! intrusive (each free slot records the next free index) and the
//! `pending` counter tracks allocated slots.

use crate::usbfs::Urb;
use softusb_core::error::UsbError;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Mutex;

pub(crate) const URB_POOL_SLOTS: usize = 4;
pub(crate) const URB_BUFFER_SIZE: usize = 1024;

/// What a reaped URB reports back to the submitting thread.
#[derive(Debug, Copy, Clone)]
pub(crate) struct UrbCompletion {
    pub status: i32,
    pub actual_length: usize,
}

pub(crate) struct UrbSlot {
    pub urb: Urb,
    pub buffer: Box<[u8; URB_BUFFER_SIZE]>,
    pub in_use: bool,
    next_free: Option<usize>,
    /// Raised by the reaper; taken by the submitter.
    pub completion: Option<SyncSender<UrbCompletion>>,
    /// Set when the submitter gave up (cancellation); the slot is
    /// returned to the free list at reap time instead.
    pub abandoned: bool,
}

struct PoolInner {
    slots: Vec<Box<UrbSlot>>,
    free_head: Option<usize>,
    pending: usize,
}

/// One endpoint's pool, guarded by an endpoint-level mutex.
pub(crate) struct UrbPool {
    inner: Mutex<PoolInner>,
}

impl UrbPool {
    pub fn new(endpoint: u8, urb_type: u8) -> Self {
        let mut slots = Vec::with_capacity(URB_POOL_SLOTS);
        for index in 0..URB_POOL_SLOTS {
            let mut slot = Box::new(UrbSlot {
                urb: Urb::new(urb_type, endpoint),
                buffer: Box::new([0u8; URB_BUFFER_SIZE]),
                in_use: false,
                next_free: if index + 1 < URB_POOL_SLOTS {
                    Some(index + 1)
                } else {
                    None
                },
                completion: None,
                abandoned: false,
            });
            slot.urb.usercontext = index as *mut std::ffi::c_void;
            slots.push(slot);
        }
        Self {
            inner: Mutex::new(PoolInner {
                slots,
                free_head: Some(0),
                pending: 0,
            }),
        }
    }

    /// Take a free slot, fill it for submission, and hand back the
    /// pointers the ioctl needs. `NoMemory` when all slots are pending.
    pub fn prepare(
        &self,
        out_data: Option<&[u8]>,
        length: usize,
    ) -> Result<(usize, *mut Urb, Receiver<UrbCompletion>), UsbError> {
        if length > URB_BUFFER_SIZE {
            return Err(UsbError::BufferTooSmall);
        }
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.free_head else {
            return Err(UsbError::NoMemory);
        };
        let (tx, rx) = std::sync::mpsc::sync_channel(1);

        let next = inner.slots[index].next_free.take();
        inner.free_head = next;
        let slot = &mut inner.slots[index];
        slot.in_use = true;
        slot.abandoned = false;
        slot.completion = Some(tx);
        if let Some(data) = out_data {
            slot.buffer[..data.len()].copy_from_slice(data);
        }
        slot.urb.buffer = slot.buffer.as_mut_ptr() as *mut std::ffi::c_void;
        slot.urb.buffer_length = length as i32;
        slot.urb.actual_length = 0;
        slot.urb.status = -libc::EINPROGRESS;
        let urb_ptr: *mut Urb = &mut slot.urb;
        inner.pending += 1;
        Ok((index, urb_ptr, rx))
    }

    /// Return a slot to the free list.
    pub fn free(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.slots[index].in_use);
        let head = inner.free_head;
        let slot = &mut inner.slots[index];
        slot.in_use = false;
        slot.completion = None;
        slot.abandoned = false;
        slot.next_free = head;
        inner.free_head = Some(index);
        inner.pending -= 1;
    }

    /// The submitter timed out; the slot stays pending until the
    /// (discarded) URB reaps.
    pub fn abandon(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[index];
        slot.abandoned = true;
        slot.completion = None;
    }

    /// Called by the reaper with the kernel's view of the finished URB.
    /// Signals the submitter (which copies its data out and frees the
    /// slot) and frees abandoned slots directly.
    pub fn complete(&self, index: usize) -> Option<UrbCompletion> {
        let (completion, free_now) = {
            let mut inner = self.inner.lock().unwrap();
            let slot = &mut inner.slots[index];
            if !slot.in_use {
                return None;
            }
            let completion = UrbCompletion {
                status: slot.urb.status,
                actual_length: slot.urb.actual_length.max(0) as usize,
            };
            if let Some(tx) = slot.completion.take() {
                let _ = tx.try_send(completion);
            }
            (completion, slot.abandoned)
        };
        if free_now {
            self.free(index);
        }
        Some(completion)
    }

    /// Copy a completed slot's buffer out to the caller.
    pub fn read_buffer(&self, index: usize, into: &mut [u8]) -> usize {
        let inner = self.inner.lock().unwrap();
        let slot = &inner.slots[index];
        let n = (slot.urb.actual_length.max(0) as usize)
            .min(into.len())
            .min(URB_BUFFER_SIZE);
        into[..n].copy_from_slice(&slot.buffer[..n]);
        n
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().pending
    }

    #[cfg(test)]
    fn free_list_len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let mut n = 0;
        let mut cursor = inner.free_head;
        while let Some(index) = cursor {
            n += 1;
            cursor = inner.slots[index].next_free;
        }
        n
    }
}

#[cfg(test)]
#[path = "tests/urb.rs"]
mod tests;
