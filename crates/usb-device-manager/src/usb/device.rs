use std::path::PathBuf;

/// A USB device as seen in sysfs during one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbDevice {
  pub bus: u32,
  pub device_number: u32,
  pub vendor: u16,
  pub product: u16,
  pub bcd: u16,
  /// Absolute device node, e.g. `/dev/bus/usb/001/002`.
  pub dev_node: PathBuf,
}

impl UsbDevice {
  /// Identifier advertised to the kubelet. Only stable while the device
  /// stays plugged into the same port.
  pub fn id(&self) -> String {
    format!(
      "{:02}:{:02}-{:04x}:{:04x}",
      self.bus, self.device_number, self.vendor, self.product
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn id_pads_numbers_and_ids() {
    let device = UsbDevice {
      bus: 1,
      device_number: 12,
      vendor: 0x145f,
      product: 0x19f,
      bcd: 0x100,
      dev_node: PathBuf::from("/dev/bus/usb/001/012"),
    };

    assert_eq!(device.id(), "01:12-145f:019f");
  }
}
