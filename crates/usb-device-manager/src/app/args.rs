use crate::{
  config,
  plugin::{RetryPolicy, UsbPluginSettings, NON_ROOT_UID},
  usb::SYSFS_USB_DEVICES,
};
use clap::{Parser, ValueEnum};
use kubelet_deviceplugin_proto::v1beta1;
use std::{path::PathBuf, time::Duration};

#[derive(ValueEnum, Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogFormat {
  Pretty,
  Json,
}

#[derive(ValueEnum, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConfigFormat {
  Json,
  Yaml,
  Toml,
  Auto,
}

impl From<ConfigFormat> for config::ConfigFormat {
  fn from(f: ConfigFormat) -> Self {
    match f {
      ConfigFormat::Json => config::ConfigFormat::Json,
      ConfigFormat::Yaml => config::ConfigFormat::Yaml,
      ConfigFormat::Toml => config::ConfigFormat::Toml,
      ConfigFormat::Auto => config::ConfigFormat::Auto,
    }
  }
}

#[derive(Parser, Debug)]
#[command(name = "usb-device-manager", about = "Exposes host USB devices to the kubelet")]
pub struct Args {
  /// Log output format
  #[arg(
    value_enum,
    long = "log-format",
    short = 'f',
    env = "LOG_FORMAT",
    default_value = "pretty"
  )]
  pub log_format: LogFormat,

  /// Config file format
  #[arg(
    value_enum,
    long = "config-format",
    short = 't',
    env = "CONFIG_FILE_FORMAT",
    default_value = "auto"
  )]
  pub config_format: ConfigFormat,

  /// Configuration file path
  #[arg(long = "config", short = 'c', env = "CONFIG_FILE")]
  pub config_file: PathBuf,

  /// Directory device plugin sockets are created in
  #[arg(long, env = "DEVICE_PLUGIN_DIR", default_value = v1beta1::DEVICE_PLUGIN_PATH)]
  pub device_plugin_dir: PathBuf,

  /// Kubelet registration socket
  #[arg(long, env = "KUBELET_SOCKET", default_value = v1beta1::KUBELET_SOCKET)]
  pub kubelet_socket: PathBuf,

  /// Directory listing the attached usb devices
  #[arg(long, env = "SYSFS_USB_ROOT", default_value = SYSFS_USB_DEVICES)]
  pub sysfs_usb_root: PathBuf,

  /// Path the host's root filesystem is mounted at
  #[arg(long, env = "HOST_ROOT", default_value = "/")]
  pub host_root: PathBuf,

  /// Uid and gid given to allocated device nodes
  #[arg(long, env = "DEVICE_OWNER", default_value_t = NON_ROOT_UID)]
  pub device_owner: u32,

  /// Retries before a device plugin that fails to start is given up on
  #[arg(long, env = "PLUGIN_RETRIES", default_value_t = 10)]
  pub plugin_retries: u32,

  /// Seconds between device plugin start attempts
  #[arg(long, env = "PLUGIN_RETRY_INTERVAL", default_value_t = 10)]
  pub plugin_retry_interval: u64,
}

impl Args {
  pub fn plugin_settings(&self) -> UsbPluginSettings {
    UsbPluginSettings {
      plugin_dir: self.device_plugin_dir.clone(),
      kubelet_socket: self.kubelet_socket.clone(),
      host_root: self.host_root.clone(),
      ..UsbPluginSettings::default()
    }
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.plugin_retries,
      interval: Duration::from_secs(self.plugin_retry_interval),
    }
  }
}
