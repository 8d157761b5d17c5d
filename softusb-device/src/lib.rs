//! Device-side protocol core.
//!
//! A device is described once, up front, with [`DeviceBuilder`]; the
//! resulting frozen descriptor tree plus a [`DeviceHal`] transport make
//! a [`Device`]. Starting the device spawns the control-endpoint
//! servicing thread, which executes standard requests internally and
//! routes class and vendor requests to the [`ClassDriver`]s bound to
//! the addressed interfaces. Class drivers move bulk and interrupt data
//! through [`EndpointHandle`]s on their own threads.
//!
//! [`DeviceHal`]: softusb_core::device_hal::DeviceHal

pub mod class;
pub mod descriptors;
pub mod device;
pub mod endpoint;

pub use class::{ClassDriver, InterfaceContext, SetupReply};
pub use descriptors::{
    ConfigurationBuilder, DescriptorTree, DeviceBuilder, EndpointSpec, InterfaceBuilder,
};
pub use device::Device;
pub use endpoint::EndpointHandle;
