use std::path::Path;

use super::Config;
use thiserror::Error;
use tokio::{fs, io};
use tracing::{event, Level};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConfigFormat {
  Json,
  Yaml,
  Toml,
  Auto,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Invalid config file extension when using auto format: {0}")]
  InvalidExtension(String),

  #[error("Config file does not have a file extension, and format is set to auto")]
  MissingExtension,

  #[error("Failed to parse config file")]
  ParseError(#[from] FormatError),

  #[error(transparent)]
  Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum FormatError {
  #[error(transparent)]
  JsonError(#[from] serde_json::Error),

  #[error(transparent)]
  YamlError(#[from] serde_yaml::Error),

  #[error(transparent)]
  TomlError(#[from] toml::de::Error),
}

trait ConfigParser {
  fn parse_config(content: &[u8]) -> Result<Config, FormatError>;
}

struct Json;
impl ConfigParser for Json {
  fn parse_config(content: &[u8]) -> Result<Config, FormatError> {
    Ok(serde_json::from_slice(content)?)
  }
}

struct Yaml;
impl ConfigParser for Yaml {
  fn parse_config(content: &[u8]) -> Result<Config, FormatError> {
    Ok(serde_yaml::from_slice(content)?)
  }
}

struct Toml;
impl ConfigParser for Toml {
  fn parse_config(content: &[u8]) -> Result<Config, FormatError> {
    Ok(toml::from_slice(content)?)
  }
}

impl ConfigFormat {
  fn resolve(self, file: &Path) -> Result<ConfigFormat, ConfigError> {
    match self {
      ConfigFormat::Auto => match file.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(ConfigFormat::Toml),
        Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
        Some("json") => Ok(ConfigFormat::Json),
        Some(other) => Err(ConfigError::InvalidExtension(other.into())),
        None => Err(ConfigError::MissingExtension),
      },
      format => Ok(format),
    }
  }

  fn parse(self, content: &[u8]) -> Result<Config, FormatError> {
    match self {
      ConfigFormat::Json => Json::parse_config(content),
      ConfigFormat::Yaml | ConfigFormat::Auto => Yaml::parse_config(content),
      ConfigFormat::Toml => Toml::parse_config(content),
    }
  }
}

pub(super) async fn read_config(
  file: impl AsRef<Path>,
  format: ConfigFormat,
) -> Result<Config, ConfigError> {
  let file = file.as_ref();

  let result = async {
    let format = format.resolve(file)?;
    let content = fs::read(file).await?;
    Ok::<_, ConfigError>(format.parse(&content)?)
  }
  .await;

  match result {
    Ok(config) => {
      event!(
        target: "usb-device-manager",
        Level::INFO,
        path = %file.display(),
        node_configs = config.node_configs().len(),
        "Loaded configuration"
      );
      event!(target: "usb-device-manager", Level::DEBUG, ?config);
      Ok(config)
    }
    Err(error) => {
      event!(target: "usb-device-manager", Level::ERROR, path = %file.display(), ?error, "Failed to read config file");
      Err(error)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{NodeConfig, NodeConfigSpec, ObjectMeta, Usb, UsbHostDevices};

  const YAML: &str = r#"
nodeConfigs:
  - metadata:
      namespace: test
      name: test
    spec:
      usb:
        - resourceName: kubevirt.io/usb-storage
          usbHostDevices:
            - selectByVendorProduct: "145f:019f"
            - selectByVendorProduct: "46f4:0001"
"#;

  fn expected() -> NodeConfig {
    NodeConfig {
      metadata: ObjectMeta {
        namespace: Some("test".into()),
        name: "test".into(),
      },
      spec: NodeConfigSpec {
        usb: vec![Usb {
          resource_name: "kubevirt.io/usb-storage".into(),
          usb_host_devices: vec![
            UsbHostDevices {
              select_by_vendor_product: "145f:019f".into(),
            },
            UsbHostDevices {
              select_by_vendor_product: "46f4:0001".into(),
            },
          ],
        }],
      },
    }
  }

  #[test]
  fn parses_yaml() {
    let config = ConfigFormat::Yaml.parse(YAML.as_bytes()).unwrap();
    assert_eq!(config.node_configs(), &[expected()]);
  }

  #[test]
  fn parses_json() {
    let json = serde_json::to_vec(&Config::from(vec![expected()])).unwrap();
    let config = ConfigFormat::Json.parse(&json).unwrap();
    assert_eq!(config.node_configs(), &[expected()]);
  }

  #[test]
  fn parses_toml() {
    let toml = r#"
[[nodeConfigs]]
metadata = { namespace = "test", name = "test" }
spec = { usb = [{ resourceName = "kubevirt.io/usb-storage", usbHostDevices = [{ selectByVendorProduct = "145f:019f" }, { selectByVendorProduct = "46f4:0001" }] }] }
"#;

    let config = ConfigFormat::Toml.parse(toml.as_bytes()).unwrap();
    assert_eq!(config.node_configs(), &[expected()]);
  }

  #[test]
  fn empty_document_has_no_node_configs() {
    let config = ConfigFormat::Json.parse(b"{}").unwrap();
    assert!(config.node_configs().is_empty());
  }

  #[test]
  fn auto_format_uses_extension() {
    assert_eq!(
      ConfigFormat::Auto.resolve(Path::new("usb.yml")).unwrap(),
      ConfigFormat::Yaml
    );
    assert_eq!(
      ConfigFormat::Auto.resolve(Path::new("usb.toml")).unwrap(),
      ConfigFormat::Toml
    );
    assert_eq!(
      ConfigFormat::Json.resolve(Path::new("usb.yml")).unwrap(),
      ConfigFormat::Json
    );
    assert!(matches!(
      ConfigFormat::Auto.resolve(Path::new("usb.ini")),
      Err(ConfigError::InvalidExtension(ext)) if ext == "ini"
    ));
    assert!(matches!(
      ConfigFormat::Auto.resolve(Path::new("usb")),
      Err(ConfigError::MissingExtension)
    ));
  }

  #[tokio::test]
  async fn reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usb.yaml");
    std::fs::write(&path, YAML).unwrap();

    let config = Config::read(&path, ConfigFormat::Auto).await.unwrap();
    assert_eq!(config.node_configs(), &[expected()]);

    let missing = Config::read(dir.path().join("missing.yaml"), ConfigFormat::Auto).await;
    assert!(matches!(missing, Err(ConfigError::Io(_))));
  }
}
