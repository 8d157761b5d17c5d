//! The usbfs ioctl surface: structures from `linux/usbdevice_fs.h` and
//! the request codes built with the standard `_IOC` bit-field encoding
//! (type `'U'`).
//!
//! usbfs historically swapped read and write in several of its `_IOR`/
//! `_IOW` definitions; that does not matter from C but the nix wrappers
//! apply const/mut, so the mismatched ones use the `_bad` macro forms
//! with explicit request codes.

use nix::{
    ioctl_read_bad, ioctl_readwrite, ioctl_write_ptr_bad, request_code_none,
    request_code_read, request_code_write,
};
use std::ffi::c_void;
use std::mem::size_of;
use std::os::raw::{c_int, c_uint};

#[derive(Debug)]
#[repr(C)]
#[allow(non_snake_case)] // field names from linux/usbdevice_fs.h
pub struct CtrlTransfer {
    pub bRequestType: u8,
    pub bRequest: u8,
    pub wValue: u16,
    pub wIndex: u16,
    pub wLength: u16,
    /// Milliseconds.
    pub timeout: u32,
    pub data: *mut c_void,
}

#[derive(Debug)]
#[repr(C)]
pub struct BulkTransfer {
    pub ep: c_uint,
    pub len: c_uint,
    /// Milliseconds.
    pub timeout: c_uint,
    pub data: *mut c_void,
}

#[derive(Debug)]
#[repr(C)]
pub struct SetInterface {
    pub interface: c_uint,
    pub altsetting: c_uint,
}

#[derive(Debug)]
#[repr(C)]
pub struct UsbfsIoctl {
    pub ifno: c_int,
    pub ioctl_code: c_int,
    pub data: *mut c_void,
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct UrbFlags: u32 {
        const SHORT_NOT_OK      = 0x01;
        const ISO_ASAP          = 0x02;
        const BULK_CONTINUATION = 0x04;
        const NO_FSBR           = 0x20;
        const ZERO_PACKET       = 0x40;
        const NO_INTERRUPT      = 0x80;
    }
}

#[allow(dead_code)]
pub const URB_TYPE_ISO: u8 = 0;
pub const URB_TYPE_INTERRUPT: u8 = 1;
#[allow(dead_code)]
pub const URB_TYPE_CONTROL: u8 = 2;
#[allow(dead_code)]
pub const URB_TYPE_BULK: u8 = 3;

#[derive(Debug)]
#[repr(C)]
pub struct Urb {
    pub urb_type: u8, // "type" is a Rust keyword
    pub endpoint: u8,
    pub status: i32,
    pub flags: u32,
    pub buffer: *mut c_void,
    pub buffer_length: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    /// Union of `number_of_packets` (iso) and `stream_id` (bulk
    /// streams); zero for everything this transport submits.
    pub number_of_packets: i32,
    pub error_count: i32,
    /// Signal on completion; 0 = none.
    pub signr: u32,
    pub usercontext: *mut c_void,
}

impl Urb {
    pub fn new(urb_type: u8, endpoint: u8) -> Self {
        Self {
            urb_type,
            endpoint,
            status: -libc::EINVAL, // in case status is read before use
            flags: UrbFlags::empty().bits(),
            buffer: std::ptr::null_mut(),
            buffer_length: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: std::ptr::null_mut(),
        }
    }
}

// The raw pointers (`buffer`, `usercontext`) reference memory owned by the
// `UrbSlot`/`Box<[u8]>` that this `Urb` lives alongside, and all access to
// them is already serialized by `UrbPool`'s mutex; there is no aliasing
// across threads that isn't already guarded.
unsafe impl Send for Urb {}

// #define USBDEVFS_CONTROL _IOWR('U', 0, struct usbdevfs_ctrltransfer)
ioctl_readwrite!(usbdevfs_control, b'U', 0, CtrlTransfer);

// #define USBDEVFS_BULK _IOWR('U', 2, struct usbdevfs_bulktransfer)
ioctl_readwrite!(usbdevfs_bulk, b'U', 2, BulkTransfer);

// #define USBDEVFS_SETINTERFACE _IOR('U', 4, struct usbdevfs_setinterface)
ioctl_write_ptr_bad!(
    usbdevfs_setinterface,
    request_code_read!(b'U', 4, size_of::<SetInterface>()),
    SetInterface
);

// #define USBDEVFS_SETCONFIGURATION _IOR('U', 5, unsigned int)
ioctl_write_ptr_bad!(
    usbdevfs_setconfiguration,
    request_code_read!(b'U', 5, size_of::<c_uint>()),
    c_uint
);

// #define USBDEVFS_SUBMITURB _IOR('U', 10, struct usbdevfs_urb)
ioctl_write_ptr_bad!(
    usbdevfs_submiturb,
    request_code_read!(b'U', 10, size_of::<Urb>()),
    Urb
);

// #define USBDEVFS_DISCARDURB _IO('U', 11)
ioctl_write_ptr_bad!(usbdevfs_discardurb, request_code_none!(b'U', 11), Urb);

// #define USBDEVFS_REAPURBNDELAY _IOW('U', 13, void *)
ioctl_read_bad!(
    usbdevfs_reapurbndelay,
    request_code_write!(b'U', 13, size_of::<*mut Urb>()),
    *mut Urb
);

// #define USBDEVFS_CLAIMINTERFACE _IOR('U', 15, unsigned int)
ioctl_write_ptr_bad!(
    usbdevfs_claiminterface,
    request_code_read!(b'U', 15, size_of::<c_uint>()),
    c_uint
);

// #define USBDEVFS_RELEASEINTERFACE _IOR('U', 16, unsigned int)
ioctl_write_ptr_bad!(
    usbdevfs_releaseinterface,
    request_code_read!(b'U', 16, size_of::<c_uint>()),
    c_uint
);

// #define USBDEVFS_IOCTL _IOWR('U', 18, struct usbdevfs_ioctl)
ioctl_readwrite!(usbdevfs_ioctl, b'U', 18, UsbfsIoctl);

/// Code embedded in [`usbdevfs_ioctl`] to unbind the kernel driver:
/// `#define USBDEVFS_DISCONNECT _IO('U', 22)`.
pub const USBDEVFS_DISCONNECT_CODE: c_int = request_code_none!(b'U', 22) as c_int;
