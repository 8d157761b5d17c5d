use super::*;
use softusb_core::types::UsbSpeed;
use std::fs;
use std::sync::mpsc::sync_channel;

fn fake_roots() -> (PathBuf, PathBuf) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let base = std::env::temp_dir().join(format!(
        "softusb-usbfs-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let sysfs = base.join("sys");
    let devfs = base.join("dev");
    fs::create_dir_all(&sysfs).unwrap();
    fs::create_dir_all(&devfs).unwrap();
    (sysfs, devfs)
}

fn fake_device(sysfs: &PathBuf, devfs: &PathBuf, name: &str, busnum: u8, devnum: u8) {
    let dir = sysfs.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("busnum"), format!("{busnum}\n")).unwrap();
    fs::write(dir.join("devnum"), format!("{devnum}\n")).unwrap();
    fs::write(dir.join("idVendor"), "1234\n").unwrap();
    fs::write(dir.join("idProduct"), "5678\n").unwrap();
    fs::write(dir.join("bDeviceClass"), "00\n").unwrap();
    fs::write(dir.join("speed"), "12\n").unwrap();
    // Stand-in for the usbfs character device.
    let bus_dir = devfs.join(format!("{busnum:03}"));
    fs::create_dir_all(&bus_dir).unwrap();
    fs::write(bus_dir.join(format!("{devnum:03}")), b"").unwrap();
}

#[test]
fn errno_mapping() {
    assert!(matches!(
        errno_error("op", Errno::ENODEV),
        UsbError::NoDevice
    ));
    assert!(matches!(errno_error("op", Errno::EPIPE), UsbError::Stall));
    assert!(matches!(errno_error("op", Errno::EAGAIN), UsbError::Nak));
    assert!(matches!(
        errno_error("op", Errno::ETIMEDOUT),
        UsbError::Nak
    ));
    match errno_error("bulk transfer", Errno::EIO) {
        UsbError::Transport(e) => {
            assert_eq!(e.operation, "bulk transfer");
            assert_eq!(e.source.raw_os_error(), Some(libc::EIO));
        }
        other => panic!("expected transport error, got {other:?}"),
    }
    assert!(urb_status_error(0).is_none());
    assert!(matches!(
        urb_status_error(-libc::EPIPE),
        Some(UsbError::Stall)
    ));
}

#[test]
fn pool_adoption_and_removal() {
    let (sysfs_root, devfs_root) = fake_roots();
    fake_device(&sysfs_root, &devfs_root, "1-4", 1, 7);
    let hal = UsbfsHostHal::with_roots(&sysfs_root, &devfs_root);
    let (tx, rx) = sync_channel(16);
    *hal.shared.events.lock().unwrap() = Some(tx);

    for info in sysfs::scan(&hal.shared.sysfs_root) {
        hal.shared.add_device(info);
    }
    assert_eq!(
        rx.try_recv().unwrap(),
        PortEvent::Connect {
            port: 1,
            speed: UsbSpeed::Full12
        }
    );

    let device = hal.shared.device(1).unwrap();
    assert_eq!(device.info.busnum, 1);
    assert_eq!(device.info.devnum, 7);
    assert!(matches!(hal.shared.device(2), Err(UsbError::NoDevice)));
    assert!(matches!(hal.shared.device(0), Err(UsbError::NoDevice)));

    // Re-adding the same busnum/devnum is a no-op.
    for info in sysfs::scan(&hal.shared.sysfs_root) {
        hal.shared.add_device(info);
    }
    assert!(rx.try_recv().is_err());

    hal.shared.device_gone_by_ids(1, 7);
    assert_eq!(rx.try_recv().unwrap(), PortEvent::Disconnect { port: 1 });
    assert!(matches!(hal.shared.device(1), Err(UsbError::NoDevice)));
    assert!(device.disconnected.load(Ordering::Acquire));

    // Gone devices refuse further transfers by lookup.
    hal.shared.device_gone(1); // idempotent
}

#[test]
fn slots_reuse_after_removal() {
    let (sysfs_root, devfs_root) = fake_roots();
    fake_device(&sysfs_root, &devfs_root, "1-1", 1, 2);
    fake_device(&sysfs_root, &devfs_root, "1-2", 1, 3);
    let hal = UsbfsHostHal::with_roots(&sysfs_root, &devfs_root);

    for info in sysfs::scan(&hal.shared.sysfs_root) {
        hal.shared.add_device(info);
    }
    assert!(hal.shared.device(1).is_ok());
    assert!(hal.shared.device(2).is_ok());

    hal.shared.device_gone(1);
    assert!(matches!(hal.shared.device(1), Err(UsbError::NoDevice)));

    // The freed slot is handed to the next arrival.
    fake_device(&sysfs_root, &devfs_root, "1-3", 1, 4);
    for info in sysfs::scan(&hal.shared.sysfs_root) {
        hal.shared.add_device(info);
    }
    let replacement = hal.shared.device(1).unwrap();
    assert_eq!(replacement.info.devnum, 4);
}

#[test]
fn assigned_address_is_tracked() {
    let (sysfs_root, devfs_root) = fake_roots();
    fake_device(&sysfs_root, &devfs_root, "1-4", 1, 7);
    let hal = UsbfsHostHal::with_roots(&sysfs_root, &devfs_root);
    for info in sysfs::scan(&hal.shared.sysfs_root) {
        hal.shared.add_device(info);
    }

    let ctx = Context::background();
    hal.assign_address(&ctx, 1, 9).unwrap();
    let device = hal.shared.device(1).unwrap();
    assert_eq!(device.address.load(Ordering::Acquire), 9);

    // Port reset is a tracked no-op on this transport.
    hal.reset_port(&ctx, 1).unwrap();
    assert!(matches!(
        hal.reset_port(&ctx, 5),
        Err(UsbError::NoDevice)
    ));
}
