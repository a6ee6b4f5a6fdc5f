mod node_config;
mod parse;
mod store;
mod watch;

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, sync::Arc};

pub use node_config::{NodeConfig, NodeConfigSpec, ObjectMeta, Usb, UsbHostDevices};
pub use parse::{ConfigError, ConfigFormat, FormatError};
pub use store::{ConfigStore, StoreEvent};
pub use watch::ConfigWatcherError;

mod inner {
  use super::*;

  #[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
  #[serde(rename_all = "camelCase")]
  pub(super) struct Config {
    #[serde(default)]
    pub(super) node_configs: Vec<NodeConfig>,
  }
}

/// The parsed configuration file. Cheap to clone.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Config {
  inner: Arc<inner::Config>,
}

impl Config {
  /// Node configurations, in file order.
  pub fn node_configs(&self) -> &[NodeConfig] {
    &self.inner.node_configs
  }
}

impl From<inner::Config> for Config {
  fn from(inner: inner::Config) -> Self {
    Self {
      inner: Arc::new(inner),
    }
  }
}

impl From<Vec<NodeConfig>> for Config {
  fn from(node_configs: Vec<NodeConfig>) -> Self {
    inner::Config { node_configs }.into()
  }
}

impl fmt::Debug for Config {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.inner, f)
  }
}

impl Serialize for Config {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    Serialize::serialize(&*self.inner, serializer)
  }
}

impl<'de> Deserialize<'de> for Config {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    <inner::Config as Deserialize>::deserialize(deserializer).map(Self::from)
  }
}

impl Config {
  pub async fn read(file: impl AsRef<Path>, format: ConfigFormat) -> Result<Config, ConfigError> {
    parse::read_config(file, format).await
  }

  pub fn watch(
    file: impl AsRef<Path>,
    format: ConfigFormat,
  ) -> Result<impl Stream<Item = Result<Config, ConfigError>>, ConfigWatcherError> {
    watch::watch(file, format)
  }
}
