use super::UsbDevice;
use std::{
  fs, io,
  num::ParseIntError,
  path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{event, Level};

pub const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// Source of the USB devices currently attached to the node.
pub trait DeviceDiscovery: Send + Sync {
  fn discover(&self) -> Result<Vec<UsbDevice>, DiscoveryError>;
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
  #[error("failed to list usb devices in {}", path.display())]
  ListDevices {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Error)]
enum UeventError {
  #[error(transparent)]
  Io(#[from] io::Error),

  #[error("uevent has no {0}")]
  Missing(&'static str),

  #[error("invalid {key} value {value:?}")]
  Invalid {
    key: &'static str,
    value: String,
    #[source]
    source: Option<ParseIntError>,
  },
}

/// Reads devices from the kernel's USB device directory.
#[derive(Debug, Clone)]
pub struct SysfsDiscovery {
  root: PathBuf,
}

impl Default for SysfsDiscovery {
  fn default() -> Self {
    Self::new(SYSFS_USB_DEVICES)
  }
}

impl SysfsDiscovery {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }
}

impl DeviceDiscovery for SysfsDiscovery {
  fn discover(&self) -> Result<Vec<UsbDevice>, DiscoveryError> {
    let entries = match fs::read_dir(&self.root) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        event!(target: "usb-device-manager", Level::DEBUG, root = %self.root.display(), "No usb device directory");
        return Ok(Vec::new());
      }
      Err(source) => {
        return Err(DiscoveryError::ListDevices {
          path: self.root.clone(),
          source,
        })
      }
    };

    let mut devices = Vec::new();
    for entry in entries {
      let entry = match entry {
        Ok(entry) => entry,
        Err(error) => {
          event!(target: "usb-device-manager", Level::DEBUG, %error, "Skipping unreadable usb device entry");
          continue;
        }
      };

      let name = entry.file_name();
      let name = name.to_string_lossy();
      // Root hubs.
      if name.starts_with("usb") {
        continue;
      }

      // Interfaces and other non-device nodes have no idVendor.
      let path = entry.path();
      if !path.join("idVendor").exists() {
        continue;
      }

      match read_uevent(&path) {
        Ok(device) => devices.push(device),
        Err(error) => {
          event!(target: "usb-device-manager", Level::DEBUG, device = %name, %error, "Skipping usb device");
        }
      }
    }

    devices.sort_by_key(|d| (d.bus, d.device_number));
    event!(target: "usb-device-manager", Level::DEBUG, count = devices.len(), "Discovered usb devices");
    Ok(devices)
  }
}

fn read_uevent(device_dir: &Path) -> Result<UsbDevice, UeventError> {
  let content = fs::read_to_string(device_dir.join("uevent"))?;
  parse_uevent(&content)
}

fn parse_number(key: &'static str, value: &str, radix: u32) -> Result<u32, UeventError> {
  u32::from_str_radix(value.trim(), radix).map_err(|source| UeventError::Invalid {
    key,
    value: value.into(),
    source: Some(source),
  })
}

fn parse_id(key: &'static str, value: &str) -> Result<u16, UeventError> {
  u16::from_str_radix(value.trim(), 16).map_err(|source| UeventError::Invalid {
    key,
    value: value.into(),
    source: Some(source),
  })
}

fn parse_uevent(content: &str) -> Result<UsbDevice, UeventError> {
  let mut bus = None;
  let mut device_number = None;
  let mut ids = None;
  let mut dev_node = None;

  for line in content.lines() {
    let (key, value) = match line.split_once('=') {
      Some(pair) => pair,
      None => continue,
    };

    match key.trim() {
      "BUSNUM" => bus = Some(parse_number("BUSNUM", value, 10)?),
      "DEVNUM" => device_number = Some(parse_number("DEVNUM", value, 10)?),
      "PRODUCT" => {
        let invalid = || UeventError::Invalid {
          key: "PRODUCT",
          value: value.into(),
          source: None,
        };

        let mut parts = value.split('/');
        let (vendor, product, bcd) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
          (Some(vendor), Some(product), Some(bcd), None) => (vendor, product, bcd),
          _ => return Err(invalid()),
        };

        ids = Some((
          parse_id("PRODUCT", vendor)?,
          parse_id("PRODUCT", product)?,
          parse_id("PRODUCT", bcd)?,
        ));
      }
      "DEVNAME" => dev_node = Some(Path::new("/dev").join(value.trim().trim_start_matches('/'))),
      _ => {}
    }
  }

  let (vendor, product, bcd) = ids.ok_or(UeventError::Missing("PRODUCT"))?;
  Ok(UsbDevice {
    bus: bus.ok_or(UeventError::Missing("BUSNUM"))?,
    device_number: device_number.ok_or(UeventError::Missing("DEVNUM"))?,
    vendor,
    product,
    bcd,
    dev_node: dev_node.ok_or(UeventError::Missing("DEVNAME"))?,
  })
}
