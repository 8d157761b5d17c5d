use super::*;
use crate::usbfs::URB_TYPE_INTERRUPT;

#[test]
fn pool_starts_with_full_free_list() {
    let pool = UrbPool::new(0x81, URB_TYPE_INTERRUPT);
    assert_eq!(pool.pending(), 0);
    assert_eq!(pool.free_list_len(), URB_POOL_SLOTS);
}

#[test]
fn exhaustion_reports_no_memory() {
    let pool = UrbPool::new(0x81, URB_TYPE_INTERRUPT);
    let mut held = Vec::new();
    for _ in 0..URB_POOL_SLOTS {
        let (index, _, _rx) = pool.prepare(None, 64).unwrap();
        held.push(index);
    }
    assert_eq!(pool.pending(), URB_POOL_SLOTS);
    assert_eq!(pool.free_list_len(), 0);
    assert!(matches!(pool.prepare(None, 64), Err(UsbError::NoMemory)));
    for index in held {
        pool.free(index);
    }
    assert_eq!(pool.pending(), 0);
    assert_eq!(pool.free_list_len(), URB_POOL_SLOTS);
}

// Every alloc/free cycle must return the pool to its starting
// invariants: each free index appears exactly once in the free list.
#[test]
fn alloc_free_cycles_do_not_poison_the_free_list() {
    let pool = UrbPool::new(0x02, URB_TYPE_INTERRUPT);
    for round in 0..50 {
        let take = (round % URB_POOL_SLOTS) + 1;
        let mut held = Vec::new();
        for _ in 0..take {
            let (index, _, _rx) = pool.prepare(None, 8).unwrap();
            assert!(!held.contains(&index), "index handed out twice");
            held.push(index);
        }
        // Free in a scrambled order.
        held.rotate_left(1);
        for index in held {
            pool.free(index);
        }
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.free_list_len(), URB_POOL_SLOTS);
    }
}

#[test]
fn oversized_request_rejected() {
    let pool = UrbPool::new(0x81, URB_TYPE_INTERRUPT);
    assert!(matches!(
        pool.prepare(None, URB_BUFFER_SIZE + 1),
        Err(UsbError::BufferTooSmall)
    ));
}

#[test]
fn out_data_lands_in_slot_buffer() {
    let pool = UrbPool::new(0x02, URB_TYPE_INTERRUPT);
    let (index, urb_ptr, _rx) = pool.prepare(Some(b"report"), 6).unwrap();
    {
        let inner = pool.inner.lock().unwrap();
        assert_eq!(&inner.slots[index].buffer[..6], b"report");
        assert_eq!(inner.slots[index].urb.buffer_length, 6);
        assert!(!urb_ptr.is_null());
    }
    pool.free(index);
}

#[test]
fn completion_signals_and_reads_back() {
    let pool = UrbPool::new(0x81, URB_TYPE_INTERRUPT);
    let (index, _, rx) = pool.prepare(None, 8).unwrap();
    {
        // Stand in for the kernel finishing the URB.
        let mut inner = pool.inner.lock().unwrap();
        let slot = &mut inner.slots[index];
        slot.urb.status = 0;
        slot.urb.actual_length = 4;
        slot.buffer[..4].copy_from_slice(&[1, 2, 3, 4]);
    }
    let done = pool.complete(index).unwrap();
    assert_eq!(done.status, 0);
    assert_eq!(done.actual_length, 4);
    let signalled = rx.try_recv().unwrap();
    assert_eq!(signalled.actual_length, 4);

    let mut out = [0u8; 8];
    assert_eq!(pool.read_buffer(index, &mut out), 4);
    assert_eq!(&out[..4], &[1, 2, 3, 4]);
    pool.free(index);
    assert_eq!(pool.free_list_len(), URB_POOL_SLOTS);
}

#[test]
fn abandoned_slot_freed_at_reap_time() {
    let pool = UrbPool::new(0x81, URB_TYPE_INTERRUPT);
    let (index, _, rx) = pool.prepare(None, 8).unwrap();
    pool.abandon(index);
    assert_eq!(pool.pending(), 1);
    drop(rx);
    {
        let mut inner = pool.inner.lock().unwrap();
        inner.slots[index].urb.status = -libc::ENOENT;
    }
    pool.complete(index);
    assert_eq!(pool.pending(), 0);
    assert_eq!(pool.free_list_len(), URB_POOL_SLOTS);
}
