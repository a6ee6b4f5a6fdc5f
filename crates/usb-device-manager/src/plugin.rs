mod chown;
mod manager;
mod usb_plugin;

use crate::usb::UsbDevice;
use async_trait::async_trait;
use kubelet_deviceplugin_proto::v1beta1::ConnectionError;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use chown::{Chown, HostChown, NON_ROOT_UID};
pub use manager::{HandlerState, PluginHandle, PluginManager, RetryPolicy};
pub use usb_plugin::{
  parse_usb_env, resource_env_var, UsbDevicePlugin, UsbEnvError, UsbPluginFactory, UsbPluginSettings,
};

#[derive(Debug, Error)]
pub enum PluginError {
  #[error("failed to serve device plugin")]
  Connection(#[from] ConnectionError),
}

/// A device plugin for one extended resource.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
  /// The extended resource name, e.g. `kubevirt.io/usb-storage`.
  fn name(&self) -> &str;

  /// The socket the plugin serves on, if any. No two running plugins may
  /// share one.
  fn endpoint(&self) -> Option<PathBuf> {
    None
  }

  /// Starts serving and registers with the kubelet. Resolves once the plugin
  /// is registered; it keeps serving until `stop` is cancelled.
  async fn start(&self, stop: CancellationToken) -> Result<(), PluginError>;

  /// Resolves once a started plugin has stopped serving.
  async fn stopped(&self) {}
}

/// Builds the plugin serving `devices` under `resource_name`.
pub trait PluginFactory: Send + Sync {
  fn create(&self, resource_name: &str, devices: Vec<UsbDevice>) -> Arc<dyn Plugin>;
}
