use super::*;
use std::fs;

struct FakeTree {
    root: PathBuf,
}

impl FakeTree {
    fn new() -> Self {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let root = std::env::temp_dir().join(format!(
            "softusb-sysfs-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    fn attr(&self, dir: &str, name: &str, value: &str) {
        let d = self.root.join(dir);
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join(name), format!("{value}\n")).unwrap();
    }

    fn device(&self, name: &str, busnum: u8, devnum: u8, speed: &str) {
        self.attr(name, "busnum", &busnum.to_string());
        self.attr(name, "devnum", &devnum.to_string());
        self.attr(name, "idVendor", "1234");
        self.attr(name, "idProduct", "5678");
        self.attr(name, "bDeviceClass", "00");
        self.attr(name, "speed", speed);
    }
}

impl Drop for FakeTree {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[test]
fn entry_classification() {
    assert!(is_device_entry("1-4"));
    assert!(is_device_entry("2-1.3"));
    assert!(!is_device_entry("usb1"));
    assert!(!is_device_entry("usb12"));
    assert!(!is_device_entry("1-4:1.0"));
}

#[test]
fn speed_mapping() {
    assert_eq!(parse_speed("1.5"), Some(UsbSpeed::Low1_1));
    assert_eq!(parse_speed("12"), Some(UsbSpeed::Full12));
    assert_eq!(parse_speed("480\n"), Some(UsbSpeed::High480));
    assert_eq!(parse_speed("5000"), None);
    assert_eq!(parse_speed(""), None);
}

#[test]
fn scan_reads_devices_and_interfaces() {
    let tree = FakeTree::new();
    tree.device("1-4", 1, 7, "480");
    // Interface node of the configured device.
    tree.attr("1-4/1-4:1.0", "bInterfaceClass", "03");
    tree.attr("1-4/1-4:1.0", "bInterfaceSubClass", "01");
    tree.attr("1-4/1-4:1.0", "bInterfaceProtocol", "01");
    // Bus root and a stray interface dir at the top level are skipped.
    tree.attr("usb1", "busnum", "1");
    tree.attr("1-4:1.0", "bInterfaceClass", "03");

    let found = scan(&tree.root);
    assert_eq!(found.len(), 1);
    let device = &found[0];
    assert_eq!(device.name, "1-4");
    assert_eq!(device.busnum, 1);
    assert_eq!(device.devnum, 7);
    assert_eq!(device.vendor_id, 0x1234);
    assert_eq!(device.product_id, 0x5678);
    assert_eq!(device.speed, UsbSpeed::High480);
    assert_eq!(device.interfaces.len(), 1);
    assert_eq!(device.interfaces[0].number, 0);
    assert_eq!(device.interfaces[0].class, 0x03);

    assert_eq!(
        device.devfs_path(Path::new("/dev/bus/usb")),
        PathBuf::from("/dev/bus/usb/001/007")
    );
}

#[test]
fn missing_attributes_skip_entry() {
    let tree = FakeTree::new();
    // No devnum.
    tree.attr("1-9", "busnum", "1");
    tree.attr("1-9", "idVendor", "1234");
    assert!(scan(&tree.root).is_empty());
}

#[test]
fn low_speed_device() {
    let tree = FakeTree::new();
    tree.device("2-1", 2, 3, "1.5");
    let found = scan(&tree.root);
    assert_eq!(found[0].speed, UsbSpeed::Low1_1);
}
