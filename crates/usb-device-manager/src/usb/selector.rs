use super::UsbDevice;
use crate::config::NodeConfig;
use std::{
  collections::{BTreeMap, HashMap},
  fmt,
  num::ParseIntError,
  str::FromStr,
};
use thiserror::Error;
use tracing::{event, Level};

/// A `vendor:product` pair, written in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VendorProduct {
  pub vendor: u16,
  pub product: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
  #[error("selector {0:?} is not of the form vendor:product")]
  MissingSeparator(String),

  #[error("selector {selector:?} has an invalid vendor id")]
  InvalidVendor {
    selector: String,
    #[source]
    source: ParseIntError,
  },

  #[error("selector {selector:?} has an invalid product id")]
  InvalidProduct {
    selector: String,
    #[source]
    source: ParseIntError,
  },
}

impl FromStr for VendorProduct {
  type Err = SelectorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (vendor, product) = s
      .split_once(':')
      .ok_or_else(|| SelectorError::MissingSeparator(s.into()))?;

    let vendor = u16::from_str_radix(vendor, 16).map_err(|source| SelectorError::InvalidVendor {
      selector: s.into(),
      source,
    })?;
    let product =
      u16::from_str_radix(product, 16).map_err(|source| SelectorError::InvalidProduct {
        selector: s.into(),
        source,
      })?;

    Ok(Self { vendor, product })
  }
}

impl fmt::Display for VendorProduct {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:04x}:{:04x}", self.vendor, self.product)
  }
}

/// Resource selectors indexed by vendor id.
#[derive(Debug, Clone, Default)]
pub struct SelectorTable {
  by_vendor: HashMap<u16, Vec<(String, VendorProduct)>>,
}

impl SelectorTable {
  /// Builds the table for every usb declaration in `config`. Selectors that
  /// fail to parse are logged and left out.
  pub fn from_node_config(config: &NodeConfig) -> Self {
    let mut table = Self::default();
    for usb in &config.spec.usb {
      event!(
        target: "usb-device-manager",
        Level::DEBUG,
        resource = %usb.resource_name,
        selectors = usb.usb_host_devices.len(),
        "Reading usb selectors"
      );

      for (index, host_device) in usb.usb_host_devices.iter().enumerate() {
        match host_device.select_by_vendor_product.parse::<VendorProduct>() {
          Ok(selector) => table.insert(&usb.resource_name, selector),
          Err(error) => {
            event!(
              target: "usb-device-manager",
              Level::WARN,
              resource = %usb.resource_name,
              index,
              %error,
              "Dropping usb host device selector"
            );
          }
        }
      }
    }

    table
  }

  pub fn insert(&mut self, resource_name: impl Into<String>, selector: VendorProduct) {
    let entries = self.by_vendor.entry(selector.vendor).or_default();
    let entry = (resource_name.into(), selector);
    if !entries.contains(&entry) {
      entries.push(entry);
    }
  }

  pub fn is_empty(&self) -> bool {
    self.by_vendor.is_empty()
  }

  /// Number of distinct selectors.
  pub fn len(&self) -> usize {
    self.by_vendor.values().map(Vec::len).sum()
  }

  /// Groups `devices` by the resource names whose selectors match them. A
  /// device matched by several resources is listed under each of them.
  pub fn match_devices<'a>(
    &self,
    devices: impl IntoIterator<Item = &'a UsbDevice>,
  ) -> BTreeMap<String, Vec<UsbDevice>> {
    let mut groups: BTreeMap<String, Vec<UsbDevice>> = BTreeMap::new();
    for device in devices {
      let entries = match self.by_vendor.get(&device.vendor) {
        Some(entries) => entries,
        None => continue,
      };

      for (resource_name, selector) in entries {
        if selector.product == device.product {
          groups
            .entry(resource_name.clone())
            .or_default()
            .push(device.clone());
        }
      }
    }

    groups
  }
}
