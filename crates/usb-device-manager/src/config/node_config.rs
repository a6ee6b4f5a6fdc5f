use serde::{Deserialize, Serialize};

/// USB passthrough configuration for the node. Objects are keyed by
/// [`NodeConfig::key`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
  pub metadata: ObjectMeta,

  #[serde(default)]
  pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub namespace: Option<String>,

  pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigSpec {
  #[serde(default)]
  pub usb: Vec<Usb>,
}

/// Devices exposed to the kubelet under one extended resource name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usb {
  pub resource_name: String,

  #[serde(default)]
  pub usb_host_devices: Vec<UsbHostDevices>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbHostDevices {
  /// `vendor:product`, both in hex. For instance `145f:019f`.
  pub select_by_vendor_product: String,
}

impl NodeConfig {
  /// `namespace/name`, or just `name` for objects without a namespace.
  pub fn key(&self) -> String {
    match self.metadata.namespace.as_deref() {
      Some(namespace) if !namespace.is_empty() => format!("{}/{}", namespace, self.metadata.name),
      _ => self.metadata.name.clone(),
    }
  }
}
