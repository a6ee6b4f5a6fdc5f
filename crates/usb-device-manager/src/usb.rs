//! USB devices attached to the node, and the selectors that group them into
//! extended resources.

mod device;
mod discovery;
mod selector;

pub use device::UsbDevice;
pub use discovery::{DeviceDiscovery, DiscoveryError, SysfsDiscovery, SYSFS_USB_DEVICES};
pub use selector::{SelectorError, SelectorTable, VendorProduct};
