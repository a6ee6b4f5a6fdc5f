use crate::{
  config::{ConfigStore, NodeConfig, StoreEvent},
  plugin::{PluginFactory, PluginManager},
  queue::WorkQueue,
  usb::{DeviceDiscovery, DiscoveryError, SelectorTable},
};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{self, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{event, span, Instrument, Level};

#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Discovery(#[from] DiscoveryError),

  #[error("device discovery task failed")]
  Join(#[from] JoinError),
}

/// Reconciles node configurations into running USB device plugins.
pub struct UsbController {
  store: ConfigStore,
  queue: WorkQueue<String>,
  discovery: Arc<dyn DeviceDiscovery>,
  plugins: PluginManager,
  factory: Arc<dyn PluginFactory>,
}

impl UsbController {
  pub fn new(
    store: ConfigStore,
    discovery: Arc<dyn DeviceDiscovery>,
    plugins: PluginManager,
    factory: Arc<dyn PluginFactory>,
  ) -> Self {
    Self {
      store,
      queue: WorkQueue::default(),
      discovery,
      plugins,
      factory,
    }
  }

  pub fn plugins(&self) -> &PluginManager {
    &self.plugins
  }

  pub fn queue(&self) -> &WorkQueue<String> {
    &self.queue
  }

  /// Queues the object behind `event`. Adds, updates and deletes are treated
  /// alike since the sync reads the current state from the store.
  pub fn enqueue(&self, event: &StoreEvent) {
    self.queue.add(event.key());
  }

  /// Processes one key. Returns `false` once the queue has shut down.
  pub async fn execute(&self) -> bool {
    let key = match self.queue.get().await {
      Some(key) => key,
      None => return false,
    };

    let span = span!(target: "usb-device-manager", Level::INFO, "sync", key = %key);
    let result = self.sync(&key).instrument(span).await;
    match result {
      Ok(()) => {
        event!(target: "usb-device-manager", Level::DEBUG, %key, "Processed node config");
        self.queue.forget(&key);
      }
      Err(error) => {
        event!(target: "usb-device-manager", Level::INFO, %key, %error, "Re-enqueuing node config");
        self.queue.add_rate_limited(key.clone());
      }
    }

    self.queue.done(&key);
    true
  }

  async fn sync(&self, key: &str) -> Result<(), SyncError> {
    match self.store.get(key) {
      Some(config) => self.sync_device_plugin(&config).await,
      // TODO: stop the plugins of deleted node configs.
      None => Ok(()),
    }
  }

  /// Starts a plugin for every resource of `config` that matches at least one
  /// attached device. Resources that already have a plugin are left alone.
  pub async fn sync_device_plugin(&self, config: &NodeConfig) -> Result<(), SyncError> {
    event!(target: "usb-device-manager", Level::INFO, name = %config.metadata.name, "Syncing usb devices");

    if config.spec.usb.is_empty() {
      event!(target: "usb-device-manager", Level::DEBUG, "No usb devices configured");
      return Ok(());
    }

    // Walking sysfs blocks.
    let discovery = self.discovery.clone();
    let devices = task::spawn_blocking(move || discovery.discover()).await??;
    if devices.is_empty() {
      event!(target: "usb-device-manager", Level::DEBUG, "No usb devices found on this node");
      return Ok(());
    }

    let selectors = SelectorTable::from_node_config(config);
    for (resource_name, devices) in selectors.match_devices(&devices) {
      event!(
        target: "usb-device-manager",
        Level::DEBUG,
        resource = %resource_name,
        devices = devices.len(),
        "Matched usb devices"
      );

      self
        .plugins
        .start_plugin(self.factory.create(&resource_name, devices));
    }

    Ok(())
  }

  /// Runs a single worker until `stop` is cancelled, then shuts the queue
  /// down and lets the worker drain it.
  pub async fn run(self: Arc<Self>, stop: CancellationToken) {
    event!(target: "usb-device-manager", Level::INFO, "Starting usb manager");

    let worker = tokio::spawn({
      let controller = self.clone();
      async move { while controller.execute().await {} }
    });

    event!(target: "usb-device-manager", Level::INFO, "Started usb manager");
    stop.cancelled().await;

    event!(target: "usb-device-manager", Level::INFO, "Stopping usb manager");
    self.queue.shut_down();
    if let Err(error) = worker.await {
      event!(target: "usb-device-manager", Level::ERROR, ?error, "Usb manager worker failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::{NodeConfigSpec, ObjectMeta, Usb, UsbHostDevices},
    plugin::{HandlerState, Plugin, PluginError},
    usb::UsbDevice,
  };
  use async_trait::async_trait;
  use parking_lot::Mutex;
  use std::{io, path::PathBuf, thread};

  const RESOURCE: &str = "kubevirt.io/usb-storage";

  struct FixedDiscovery(Result<Vec<UsbDevice>, io::ErrorKind>);

  impl DeviceDiscovery for FixedDiscovery {
    fn discover(&self) -> Result<Vec<UsbDevice>, DiscoveryError> {
      self.0.clone().map_err(|kind| DiscoveryError::ListDevices {
        path: PathBuf::from("/sys/bus/usb/devices"),
        source: kind.into(),
      })
    }
  }

  struct StartedPlugin(String);

  #[async_trait]
  impl Plugin for StartedPlugin {
    fn name(&self) -> &str {
      &self.0
    }

    async fn start(&self, _stop: CancellationToken) -> Result<(), PluginError> {
      Ok(())
    }
  }

  #[derive(Default)]
  struct RecordingFactory {
    created: Mutex<Vec<(String, Vec<UsbDevice>)>>,
  }

  impl PluginFactory for RecordingFactory {
    fn create(&self, resource_name: &str, devices: Vec<UsbDevice>) -> Arc<dyn Plugin> {
      self
        .created
        .lock()
        .push((resource_name.to_owned(), devices));
      Arc::new(StartedPlugin(resource_name.to_owned()))
    }
  }

  fn storage_device() -> UsbDevice {
    UsbDevice {
      bus: 1,
      device_number: 2,
      vendor: 0x145f,
      product: 0x019f,
      bcd: 0x100,
      dev_node: PathBuf::from("/dev/bus/usb/001/002"),
    }
  }

  fn node_config(selectors: &[&str]) -> NodeConfig {
    NodeConfig {
      metadata: ObjectMeta {
        namespace: Some("test".into()),
        name: "test".into(),
      },
      spec: NodeConfigSpec {
        usb: vec![Usb {
          resource_name: RESOURCE.into(),
          usb_host_devices: selectors
            .iter()
            .map(|s| UsbHostDevices {
              select_by_vendor_product: (*s).into(),
            })
            .collect(),
        }],
      },
    }
  }

  fn controller(
    discovery: FixedDiscovery,
  ) -> (Arc<UsbController>, ConfigStore, Arc<RecordingFactory>) {
    let store = ConfigStore::new();
    let factory = Arc::new(RecordingFactory::default());
    let controller = UsbController::new(
      store.clone(),
      Arc::new(discovery),
      PluginManager::default(),
      factory.clone(),
    );

    (Arc::new(controller), store, factory)
  }

  #[tokio::test]
  async fn sync_starts_one_plugin_per_resource() {
    let (controller, _, factory) = controller(FixedDiscovery(Ok(vec![storage_device()])));
    let config = node_config(&["145f:019f"]);

    controller.sync_device_plugin(&config).await.unwrap();
    controller.sync_device_plugin(&config).await.unwrap();

    let plugins = controller.plugins();
    assert_eq!(plugins.len(), 1);
    let handle = plugins.handler(RESOURCE).unwrap();
    assert!(handle.wait_for(HandlerState::Started).await);

    let created = factory.created.lock();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0], (RESOURCE.to_owned(), vec![storage_device()]));
  }

  #[tokio::test]
  async fn sync_without_matches_starts_nothing() {
    let (controller, _, factory) = controller(FixedDiscovery(Ok(vec![storage_device()])));

    controller
      .sync_device_plugin(&node_config(&["46f4:0001", "not-a-selector"]))
      .await
      .unwrap();
    controller
      .sync_device_plugin(&node_config(&[]))
      .await
      .unwrap();

    assert!(controller.plugins().is_empty());
    assert!(factory.created.lock().is_empty());
  }

  #[tokio::test]
  async fn sync_without_devices_starts_nothing() {
    let (controller, _, _) = controller(FixedDiscovery(Ok(vec![])));

    controller
      .sync_device_plugin(&node_config(&["145f:019f"]))
      .await
      .unwrap();
    assert!(controller.plugins().is_empty());
  }

  struct ThreadRecordingDiscovery(Mutex<Option<thread::ThreadId>>);

  impl DeviceDiscovery for ThreadRecordingDiscovery {
    fn discover(&self) -> Result<Vec<UsbDevice>, DiscoveryError> {
      *self.0.lock() = Some(thread::current().id());
      Ok(vec![storage_device()])
    }
  }

  #[tokio::test(flavor = "current_thread")]
  async fn discovery_runs_off_the_runtime_thread() {
    let discovery = Arc::new(ThreadRecordingDiscovery(Mutex::new(None)));
    let controller = UsbController::new(
      ConfigStore::new(),
      discovery.clone(),
      PluginManager::default(),
      Arc::new(RecordingFactory::default()),
    );

    controller
      .sync_device_plugin(&node_config(&["145f:019f"]))
      .await
      .unwrap();

    let discovered_on = discovery.0.lock().take().unwrap();
    assert_ne!(discovered_on, thread::current().id());
    assert!(controller.plugins().contains(RESOURCE));
  }

  #[tokio::test]
  async fn execute_syncs_stored_config() {
    let (controller, store, _) = controller(FixedDiscovery(Ok(vec![storage_device()])));

    for event in store.replace(vec![node_config(&["145f:019f"])]) {
      controller.enqueue(&event);
    }
    controller.queue().add("test/deleted".into());

    assert!(controller.execute().await);
    assert!(controller.plugins().contains(RESOURCE));
    assert!(controller.execute().await);
    assert_eq!(controller.plugins().len(), 1);
    assert!(controller.queue().is_empty());

    controller.queue().shut_down();
    assert!(!controller.execute().await);
  }

  #[tokio::test(start_paused = true)]
  async fn failed_sync_is_requeued() {
    let (controller, store, _) =
      controller(FixedDiscovery(Err(io::ErrorKind::PermissionDenied)));

    for event in store.replace(vec![node_config(&["145f:019f"])]) {
      controller.enqueue(&event);
    }

    assert!(controller.execute().await);
    assert_eq!(controller.queue().num_requeues(&"test/test".to_owned()), 1);
    assert!(controller.plugins().is_empty());

    // The retry shows up once its backoff has passed.
    assert!(controller.execute().await);
    assert_eq!(controller.queue().num_requeues(&"test/test".to_owned()), 2);
  }

  #[tokio::test]
  async fn run_stops_with_token() {
    let (controller, store, _) = controller(FixedDiscovery(Ok(vec![storage_device()])));
    for event in store.replace(vec![node_config(&["145f:019f"])]) {
      controller.enqueue(&event);
    }

    let stop = CancellationToken::new();
    let running = tokio::spawn(controller.clone().run(stop.clone()));

    let handle = loop {
      if let Some(handle) = controller.plugins().handler(RESOURCE) {
        break handle;
      }
      tokio::task::yield_now().await;
    };
    assert!(handle.wait_for(HandlerState::Started).await);

    stop.cancel();
    running.await.unwrap();
    assert!(controller.queue().is_shutting_down());
  }
}
