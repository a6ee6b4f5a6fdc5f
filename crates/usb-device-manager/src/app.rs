mod args;

use self::args::{Args, ConfigFormat, LogFormat};
use crate::{
  config::{Config, ConfigError, ConfigStore},
  controller::UsbController,
  plugin::{HostChown, PluginManager, UsbPluginFactory},
  signals::Signal,
  usb::SysfsDiscovery,
};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::{pin_mut, select, StreamExt};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
enum Action {
  None,
  Reload,
  Apply,
  Shutdown,
}

struct App {
  config_file: PathBuf,
  config_format: ConfigFormat,
  config: Config,
  store: ConfigStore,
  controller: Arc<UsbController>,
  stop: CancellationToken,
  worker: Option<JoinHandle<()>>,
}

impl App {
  async fn new(args: Args) -> Result<Self> {
    let config = Config::read(&args.config_file, args.config_format.into())
      .await
      .with_context(|| format!("failed to read {}", args.config_file.display()))?;

    let store = ConfigStore::new();
    let chown = HostChown::new(args.device_owner, args.device_owner);
    let factory = UsbPluginFactory::new(args.plugin_settings(), Arc::new(chown));
    let controller = UsbController::new(
      store.clone(),
      Arc::new(SysfsDiscovery::new(args.sysfs_usb_root.clone())),
      PluginManager::new(args.retry_policy()),
      Arc::new(factory),
    );

    Ok(App {
      config_file: args.config_file,
      config_format: args.config_format,
      config,
      store,
      controller: Arc::new(controller),
      stop: CancellationToken::new(),
      worker: None,
    })
  }

  async fn run(&mut self) -> Result<()> {
    let config_stream = Config::watch(self.config_file.clone(), self.config_format.into())?.fuse();
    pin_mut!(config_stream);

    let signal_stream = Signal::watch()?.fuse();
    pin_mut!(signal_stream);

    self.worker = Some(tokio::spawn(self.controller.clone().run(self.stop.clone())));

    let mut action = Action::Apply;
    let result = loop {
      let next = match action {
        Action::Shutdown => break Ok(()),
        Action::Reload => self.reload().await,
        Action::Apply => self.apply(),
        Action::None => select! {
          c = config_stream.next() => self.on_config(c),
          s = signal_stream.next() => self.on_signal(s),
        },
      };

      action = match next {
        Ok(action) => action,
        Err(e) => break Err(e),
      };
    };

    self.shutdown().await;
    result
  }

  /// Pushes the current config into the store and queues whatever changed.
  fn apply(&mut self) -> Result<Action> {
    let events = self.store.replace(self.config.node_configs().iter().cloned());
    event!(
      target: "usb-device-manager",
      Level::INFO,
      node_configs = self.store.len(),
      changes = events.len(),
      "Applied config"
    );

    for event in &events {
      self.controller.enqueue(event);
    }

    Ok(Action::None)
  }

  async fn reload(&mut self) -> Result<Action> {
    let config = Config::read(&self.config_file, self.config_format.into()).await;
    self.on_config(Some(config))
  }

  fn on_config(&mut self, config: Option<Result<Config, ConfigError>>) -> Result<Action> {
    match config {
      None => {
        event!(
          target: "usb-device-manager",
          Level::ERROR,
          "Config watcher closed."
        );

        Err(anyhow!("config watcher closed")).context("on_config")
      }

      Some(Err(e)) => {
        event!(
          target: "usb-device-manager",
          Level::ERROR,
          "Failed to read config, keeping the current one: {:#?}",
          e
        );

        Ok(Action::None)
      }

      Some(Ok(c)) if c == self.config => {
        event!(target: "usb-device-manager", Level::DEBUG, "Config unchanged");
        Ok(Action::None)
      }

      Some(Ok(c)) => {
        self.config = c;
        Ok(Action::Apply)
      }
    }
  }

  fn on_signal(&mut self, signal: Option<Signal>) -> Result<Action> {
    match signal {
      None => {
        event!(
          target: "usb-device-manager",
          Level::ERROR,
          "Signal stream stopped, shutting down.",
        );

        Err(anyhow!("signal stream stopped")).context("on_signal")
      }

      Some(s) if s.is_reload() => {
        event!(target: "usb-device-manager", Level::INFO, "Received {}, reloading config", s);
        Ok(Action::Reload)
      }

      Some(s) => {
        event!(
          target: "usb-device-manager",
          Level::INFO,
          "Received signal {}, shutting down.",
          s
        );
        Ok(Action::Shutdown)
      }
    }
  }

  async fn shutdown(&mut self) {
    self.stop.cancel();
    if let Some(worker) = self.worker.take() {
      if let Err(e) = worker.await {
        event!(target: "usb-device-manager", Level::ERROR, "Usb manager task failed: {:#?}", e);
      }
    }

    let plugins = self.controller.plugins();
    for handle in plugins
      .resource_names()
      .iter()
      .filter_map(|name| plugins.handler(name))
    {
      event!(
        target: "usb-device-manager",
        Level::DEBUG,
        resource = handle.name(),
        state = ?handle.state(),
        "Stopping device plugin"
      );
    }

    if time::timeout(SHUTDOWN_TIMEOUT, plugins.stop_all())
      .await
      .is_err()
    {
      event!(
        target: "usb-device-manager",
        Level::WARN,
        resources = ?plugins.resource_names(),
        "Device plugins did not stop in time"
      );
    }

    event!(target: "usb-device-manager", Level::INFO, "Shut down");
  }
}

pub async fn run() -> Result<()> {
  let args = Args::parse();
  let filter = EnvFilter::from_default_env()
    // Set the base level when not matched by other directives to INFO.
    .add_directive(tracing::Level::INFO.into());

  match args.log_format {
    LogFormat::Pretty => {
      tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    LogFormat::Json => {
      tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_span_list(false)
        .init();
    }
  }

  let mut app = App::new(args).await?;
  app.run().await?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{ffi::OsString, fs, path::Path};

  const STORAGE_CONFIG: &str = r#"
nodeConfigs:
  - metadata:
      namespace: default
      name: node-a
    spec:
      usb:
        - resourceName: kubevirt.io/usb-storage
          usbHostDevices:
            - selectByVendorProduct: "145f:019f"
"#;

  async fn app(dir: &Path, config: &str) -> App {
    let config_file = dir.join("config.yaml");
    fs::write(&config_file, config).unwrap();

    let args: Vec<OsString> = vec![
      "usb-device-manager".into(),
      "--config".into(),
      config_file.into(),
      "--sysfs-usb-root".into(),
      dir.join("devices").into(),
      "--device-plugin-dir".into(),
      dir.into(),
    ];
    let args = Args::try_parse_from(args).unwrap();

    App::new(args).await.unwrap()
  }

  #[tokio::test]
  async fn startup_requires_a_readable_config() {
    let dir = tempfile::tempdir().unwrap();
    let args: Vec<OsString> = vec![
      "usb-device-manager".into(),
      "--config".into(),
      dir.path().join("missing.yaml").into(),
    ];
    let args = Args::try_parse_from(args).unwrap();

    assert!(App::new(args).await.is_err());
  }

  #[tokio::test]
  async fn apply_fills_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = app(dir.path(), STORAGE_CONFIG).await;

    assert_eq!(app.apply().unwrap(), Action::None);
    assert_eq!(app.store.keys(), vec!["default/node-a".to_owned()]);
    assert_eq!(app.controller.queue().len(), 1);

    // Nothing changed, nothing queued.
    assert_eq!(app.apply().unwrap(), Action::None);
    assert_eq!(app.controller.queue().len(), 1);
  }

  #[tokio::test]
  async fn reload_keeps_config_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = app(dir.path(), STORAGE_CONFIG).await;
    let before = app.config.clone();

    assert_eq!(app.reload().await.unwrap(), Action::None);
    assert_eq!(app.config, before);

    fs::write(dir.path().join("config.yaml"), "nodeConfigs: [").unwrap();
    assert_eq!(app.reload().await.unwrap(), Action::None);
    assert_eq!(app.config, before);

    fs::write(dir.path().join("config.yaml"), "nodeConfigs: []").unwrap();
    assert_eq!(app.reload().await.unwrap(), Action::Apply);
    assert!(app.config.node_configs().is_empty());
  }

  #[tokio::test]
  async fn signals_map_to_actions() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = app(dir.path(), STORAGE_CONFIG).await;

    assert_eq!(app.on_signal(Some(Signal::SigHup)).unwrap(), Action::Reload);
    assert_eq!(app.on_signal(Some(Signal::SigTerm)).unwrap(), Action::Shutdown);
    assert_eq!(app.on_signal(Some(Signal::SigInt)).unwrap(), Action::Shutdown);
    assert!(app.on_signal(None).is_err());
    assert!(app.on_config(None).is_err());
  }

  #[tokio::test]
  async fn shutdown_stops_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = app(dir.path(), STORAGE_CONFIG).await;

    app.worker = Some(tokio::spawn(app.controller.clone().run(app.stop.clone())));
    app.apply().unwrap();
    app.shutdown().await;

    assert!(app.stop.is_cancelled());
    assert!(app.controller.queue().is_shutting_down());
    assert!(app.worker.is_none());
    // No devices under the sysfs root, so nothing was started.
    assert!(app.controller.plugins().is_empty());
  }
}
