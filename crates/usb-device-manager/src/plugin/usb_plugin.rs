use super::{Chown, HostChown, Plugin, PluginError, PluginFactory};
use crate::usb::UsbDevice;
use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use kubelet_deviceplugin_proto::{
  tonic::Status,
  v1beta1::{
    self, AllocateRequest, AllocateResponse, ContainerAllocateRequest, ContainerAllocateResponse,
    Device, DevicePlugin, DeviceSpec, KubeletDevicePlugin, ListAndWatchResponse,
    RegistrationOptions,
  },
};
use parking_lot::Mutex;
use std::{
  io,
  num::ParseIntError,
  path::{Component, Path, PathBuf},
  pin::Pin,
  sync::Arc,
  time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{event, Instrument, Level, Span};

const DEVICE_PERMISSIONS: &str = "mrw";

/// Where plugins listen, where the kubelet is, and where the host's device
/// nodes can be reached from this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbPluginSettings {
  pub plugin_dir: PathBuf,
  pub kubelet_socket: PathBuf,
  pub host_root: PathBuf,
  pub registration_timeout: Duration,
}

impl Default for UsbPluginSettings {
  fn default() -> Self {
    Self {
      plugin_dir: PathBuf::from(v1beta1::DEVICE_PLUGIN_PATH),
      kubelet_socket: PathBuf::from(v1beta1::KUBELET_SOCKET),
      host_root: PathBuf::from("/"),
      registration_timeout: v1beta1::REGISTRATION_TIMEOUT,
    }
  }
}

/// Name of the environment variable that carries the allocated devices of
/// `resource_name` into the container, e.g. `USB_KUBEVIRT_IO_USB-STORAGE`.
pub fn resource_env_var(resource_name: &str) -> String {
  let name = resource_name
    .to_uppercase()
    .replace(|c: char| c == '/' || c == '.', "_");

  format!("USB_{}", name)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsbEnvError {
  #[error("usb address {0:?} is not of the form bus:device")]
  MissingSeparator(String),

  #[error("usb address {address:?} is not numeric")]
  InvalidNumber {
    address: String,
    #[source]
    source: ParseIntError,
  },
}

/// Decodes the value of a [`resource_env_var`] variable into
/// `(bus, device_number)` pairs.
pub fn parse_usb_env(value: &str) -> Result<Vec<(u32, u32)>, UsbEnvError> {
  value
    .split(',')
    .filter(|address| !address.is_empty())
    .map(|address| -> Result<(u32, u32), UsbEnvError> {
      let (bus, device) = address
        .split_once(':')
        .ok_or_else(|| UsbEnvError::MissingSeparator(address.into()))?;
      let number = |s: &str| {
        s.parse::<u32>().map_err(|source| UsbEnvError::InvalidNumber {
          address: address.into(),
          source,
        })
      };

      Ok((number(bus)?, number(device)?))
    })
    .collect()
}

const MAX_SOCKET_SLUG: usize = 48;

/// Socket file for `resource_name`. The checksum of the full name keeps
/// names that slugify alike apart, the slug only makes it readable.
fn socket_name(resource_name: &str) -> String {
  let mut slug = slug::slugify(resource_name);
  slug.truncate(MAX_SOCKET_SLUG);
  let checksum = crc32fast::hash(resource_name.as_bytes());

  format!("usb-{}-{:08x}.sock", slug.trim_end_matches('-'), checksum)
}

/// Joins `dev_node` under `root` and checks that it exists. Parent directory
/// components are rejected.
fn resolve_host_path(root: &Path, dev_node: &Path) -> io::Result<PathBuf> {
  let mut path = root.to_path_buf();
  for component in dev_node.components() {
    match component {
      Component::RootDir | Component::CurDir => {}
      Component::Normal(part) => path.push(part),
      Component::ParentDir | Component::Prefix(_) => {
        return Err(io::Error::new(
          io::ErrorKind::InvalidInput,
          format!("device path {} escapes the host root", dev_node.display()),
        ))
      }
    }
  }

  path.symlink_metadata()?;
  Ok(path)
}

/// Serves the USB devices of one resource name to the kubelet.
pub struct UsbDevicePlugin {
  resource_name: String,
  socket_name: String,
  devices: Arc<[UsbDevice]>,
  settings: UsbPluginSettings,
  chown: Arc<dyn Chown>,
  server: Mutex<Option<JoinHandle<()>>>,
}

impl UsbDevicePlugin {
  pub fn new(
    resource_name: impl Into<String>,
    devices: Vec<UsbDevice>,
    settings: UsbPluginSettings,
    chown: Arc<dyn Chown>,
  ) -> Self {
    let resource_name = resource_name.into();
    Self {
      socket_name: socket_name(&resource_name),
      resource_name,
      devices: devices.into(),
      settings,
      chown,
      server: Mutex::new(None),
    }
  }

  pub fn socket_path(&self) -> PathBuf {
    self.settings.plugin_dir.join(&self.socket_name)
  }

  fn session(&self, stop: CancellationToken) -> UsbDeviceSession {
    UsbDeviceSession {
      env_var: resource_env_var(&self.resource_name),
      devices: self.devices.clone(),
      host_root: self.settings.host_root.clone(),
      chown: self.chown.clone(),
      stop,
    }
  }
}

#[async_trait]
impl Plugin for UsbDevicePlugin {
  fn name(&self) -> &str {
    &self.resource_name
  }

  fn endpoint(&self) -> Option<PathBuf> {
    Some(self.socket_path())
  }

  async fn start(&self, stop: CancellationToken) -> Result<(), PluginError> {
    let options = RegistrationOptions::new(&self.resource_name, &self.socket_name)
      .with_plugin_dir(&self.settings.plugin_dir)
      .with_kubelet_socket(&self.settings.kubelet_socket)
      .with_timeout(self.settings.registration_timeout);

    let shutdown = {
      let stop = stop.clone();
      async move { stop.cancelled().await }
    };

    let server = KubeletDevicePlugin::new(self.session(stop))
      .start(options, shutdown)
      .await?;

    let task = tokio::spawn(
      async move {
        match server.await {
          Ok(()) => {
            event!(target: "usb-device-manager", Level::INFO, "Device plugin server stopped");
          }
          Err(error) => {
            event!(target: "usb-device-manager", Level::ERROR, ?error, "Device plugin server failed");
          }
        }
      }
      .instrument(Span::current()),
    );

    if let Some(previous) = self.server.lock().replace(task) {
      previous.abort();
    }

    Ok(())
  }

  async fn stopped(&self) {
    let task = self.server.lock().take();
    if let Some(task) = task {
      if let Err(error) = task.await {
        event!(target: "usb-device-manager", Level::WARN, ?error, "Device plugin server task failed");
      }
    }
  }
}

/// Builds [`UsbDevicePlugin`]s sharing one set of settings.
#[derive(Clone)]
pub struct UsbPluginFactory {
  settings: UsbPluginSettings,
  chown: Arc<dyn Chown>,
}

impl UsbPluginFactory {
  pub fn new(settings: UsbPluginSettings, chown: Arc<dyn Chown>) -> Self {
    Self { settings, chown }
  }
}

impl Default for UsbPluginFactory {
  fn default() -> Self {
    Self::new(UsbPluginSettings::default(), Arc::new(HostChown::default()))
  }
}

impl PluginFactory for UsbPluginFactory {
  fn create(&self, resource_name: &str, devices: Vec<UsbDevice>) -> Arc<dyn Plugin> {
    Arc::new(UsbDevicePlugin::new(
      resource_name,
      devices,
      self.settings.clone(),
      self.chown.clone(),
    ))
  }
}

/// The gRPC side of a started plugin. The device list is fixed for the
/// lifetime of the session.
struct UsbDeviceSession {
  env_var: String,
  devices: Arc<[UsbDevice]>,
  host_root: PathBuf,
  chown: Arc<dyn Chown>,
  stop: CancellationToken,
}

type DeviceListStream = Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

impl UsbDeviceSession {
  fn allocate_container(
    &self,
    request: &ContainerAllocateRequest,
  ) -> Result<ContainerAllocateResponse, Status> {
    let mut response = ContainerAllocateResponse::default();
    let mut addresses = Vec::new();

    for id in &request.devices_ids {
      let device = match self.devices.iter().find(|device| device.id() == *id) {
        Some(device) => device,
        None => {
          event!(target: "usb-device-manager", Level::DEBUG, device = %id, "Usb device disappeared");
          continue;
        }
      };

      let host_path = resolve_host_path(&self.host_root, &device.dev_node).map_err(|error| {
        event!(target: "usb-device-manager", Level::ERROR, device = %id, %error, "Failed to resolve usb device node");
        Status::internal(format!(
          "error opening usb device {}: {}",
          device.dev_node.display(),
          error
        ))
      })?;

      self.chown.chown(&host_path).map_err(|error| {
        event!(target: "usb-device-manager", Level::ERROR, device = %id, %error, "Failed to change usb device owner");
        Status::internal(format!(
          "error setting the owner of usb device {}: {}",
          device.dev_node.display(),
          error
        ))
      })?;

      let dev_node = device.dev_node.to_string_lossy().into_owned();
      response.devices.push(DeviceSpec {
        container_path: dev_node.clone(),
        host_path: dev_node,
        permissions: DEVICE_PERMISSIONS.into(),
      });
      addresses.push(format!("{}:{}", device.bus, device.device_number));
    }

    if !addresses.is_empty() {
      response
        .envs
        .insert(self.env_var.clone(), addresses.join(","));
    }

    Ok(response)
  }
}

#[async_trait]
impl DevicePlugin for UsbDeviceSession {
  type ListAndWatchStream = DeviceListStream;

  async fn list_and_watch(&self) -> Result<Self::ListAndWatchStream, Status> {
    let devices: Vec<_> = self
      .devices
      .iter()
      .map(|device| Device::healthy(device.id()))
      .collect();
    let stop = self.stop.clone();

    // TODO: report devices as unhealthy once they are unplugged.
    Ok(Box::pin(stream! {
      yield Ok::<_, Status>(ListAndWatchResponse { devices });
      stop.cancelled().await;
      yield Ok(ListAndWatchResponse::default());
    }))
  }

  async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse, Status> {
    let container_responses = request
      .container_requests
      .iter()
      .map(|container| self.allocate_container(container))
      .collect::<Result<Vec<_>, Status>>()?;

    Ok(AllocateResponse {
      container_responses,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::StreamExt;
  use std::{fs, sync::Mutex as StdMutex};

  #[derive(Default)]
  struct RecordingChown {
    paths: StdMutex<Vec<PathBuf>>,
    fail: bool,
  }

  impl Chown for RecordingChown {
    fn chown(&self, path: &Path) -> io::Result<()> {
      if self.fail {
        return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
      }

      self.paths.lock().unwrap().push(path.to_owned());
      Ok(())
    }
  }

  fn device(device_number: u32) -> UsbDevice {
    UsbDevice {
      bus: 1,
      device_number,
      vendor: 0x145f,
      product: 0x019f,
      bcd: 0x100,
      dev_node: PathBuf::from(format!("/dev/bus/usb/001/{:03}", device_number)),
    }
  }

  struct Fixture {
    host_root: tempfile::TempDir,
    chown: Arc<RecordingChown>,
  }

  impl Fixture {
    fn new(chown: RecordingChown) -> Self {
      let host_root = tempfile::tempdir().unwrap();
      let bus = host_root.path().join("dev/bus/usb/001");
      fs::create_dir_all(&bus).unwrap();
      fs::write(bus.join("002"), "").unwrap();
      fs::write(bus.join("003"), "").unwrap();

      Self {
        host_root,
        chown: Arc::new(chown),
      }
    }

    fn session(&self, devices: Vec<UsbDevice>) -> UsbDeviceSession {
      UsbDeviceSession {
        env_var: resource_env_var("kubevirt.io/usb-storage"),
        devices: devices.into(),
        host_root: self.host_root.path().to_owned(),
        chown: self.chown.clone(),
        stop: CancellationToken::new(),
      }
    }
  }

  fn request(ids: &[&[&str]]) -> AllocateRequest {
    AllocateRequest {
      container_requests: ids
        .iter()
        .map(|ids| ContainerAllocateRequest {
          devices_ids: ids.iter().map(|id| (*id).to_owned()).collect(),
        })
        .collect(),
    }
  }

  #[test]
  fn env_var_follows_resource_name() {
    assert_eq!(
      resource_env_var("kubevirt.io/usb-storage"),
      "USB_KUBEVIRT_IO_USB-STORAGE"
    );
  }

  #[test]
  fn socket_name_covers_the_whole_resource_name() {
    let storage = socket_name("kubevirt.io/usb-storage");
    assert!(storage.starts_with("usb-kubevirt-io-usb-storage-"), "{}", storage);
    assert!(storage.ends_with(".sock"));
    assert_eq!(storage, socket_name("kubevirt.io/usb-storage"));

    assert_ne!(socket_name("vendor-a.io/usb"), socket_name("vendor-b.io/usb"));
    assert_ne!(socket_name("usb.storage"), socket_name("usb-storage"));

    let long = socket_name(&format!("vendor.example/{}", "camera".repeat(40)));
    assert!(long.len() <= "usb-".len() + MAX_SOCKET_SLUG + "-00000000.sock".len());
  }

  #[test]
  fn usb_env_round_trip() {
    let devices = [device(2), device(13)];
    let value = devices
      .iter()
      .map(|d| format!("{}:{}", d.bus, d.device_number))
      .collect::<Vec<_>>()
      .join(",");

    assert_eq!(parse_usb_env(&value).unwrap(), vec![(1, 2), (1, 13)]);
    assert!(parse_usb_env("").unwrap().is_empty());
    assert!(matches!(
      parse_usb_env("1-2"),
      Err(UsbEnvError::MissingSeparator(_))
    ));
    assert!(matches!(
      parse_usb_env("1:x"),
      Err(UsbEnvError::InvalidNumber { .. })
    ));
  }

  #[test]
  fn host_paths_stay_below_root() {
    let fixture = Fixture::new(RecordingChown::default());
    let root = fixture.host_root.path();

    assert_eq!(
      resolve_host_path(root, Path::new("/dev/bus/usb/001/002")).unwrap(),
      root.join("dev/bus/usb/001/002")
    );
    assert_eq!(
      resolve_host_path(root, Path::new("/dev/../etc/passwd"))
        .unwrap_err()
        .kind(),
      io::ErrorKind::InvalidInput
    );
    assert_eq!(
      resolve_host_path(root, Path::new("/dev/bus/usb/001/099"))
        .unwrap_err()
        .kind(),
      io::ErrorKind::NotFound
    );
  }

  #[tokio::test]
  async fn allocate_exposes_known_devices() {
    let fixture = Fixture::new(RecordingChown::default());
    let session = fixture.session(vec![device(2), device(3)]);

    let response = session
      .allocate(request(&[
        &["01:02-145f:019f", "01:09-145f:019f", "01:03-145f:019f"],
        &["01:09-145f:019f"],
      ]))
      .await
      .unwrap();

    assert_eq!(response.container_responses.len(), 2);

    let first = &response.container_responses[0];
    assert_eq!(
      first.envs.get("USB_KUBEVIRT_IO_USB-STORAGE").map(String::as_str),
      Some("1:2,1:3")
    );
    assert_eq!(
      first.devices,
      vec![
        DeviceSpec {
          container_path: "/dev/bus/usb/001/002".into(),
          host_path: "/dev/bus/usb/001/002".into(),
          permissions: "mrw".into(),
        },
        DeviceSpec {
          container_path: "/dev/bus/usb/001/003".into(),
          host_path: "/dev/bus/usb/001/003".into(),
          permissions: "mrw".into(),
        },
      ]
    );

    let second = &response.container_responses[1];
    assert!(second.envs.is_empty());
    assert!(second.devices.is_empty());

    let root = fixture.host_root.path();
    assert_eq!(
      *fixture.chown.paths.lock().unwrap(),
      vec![
        root.join("dev/bus/usb/001/002"),
        root.join("dev/bus/usb/001/003")
      ]
    );
  }

  #[tokio::test]
  async fn allocate_fails_when_owner_cannot_be_changed() {
    let fixture = Fixture::new(RecordingChown {
      fail: true,
      ..Default::default()
    });
    let session = fixture.session(vec![device(2)]);

    let status = session
      .allocate(request(&[&["01:02-145f:019f"]]))
      .await
      .unwrap_err();
    assert_eq!(status.code(), kubelet_deviceplugin_proto::tonic::Code::Internal);
  }

  #[tokio::test]
  async fn allocate_fails_when_device_node_is_missing() {
    let fixture = Fixture::new(RecordingChown::default());
    let session = fixture.session(vec![device(7)]);

    let status = session
      .allocate(request(&[&["01:07-145f:019f"]]))
      .await
      .unwrap_err();
    assert_eq!(status.code(), kubelet_deviceplugin_proto::tonic::Code::Internal);
    assert!(fixture.chown.paths.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn list_and_watch_sends_empty_list_on_stop() {
    let fixture = Fixture::new(RecordingChown::default());
    let session = fixture.session(vec![device(2), device(3)]);
    let stop = session.stop.clone();

    let mut updates = session.list_and_watch().await.unwrap();

    let first = updates.next().await.unwrap().unwrap();
    assert_eq!(
      first.devices,
      vec![
        Device::healthy("01:02-145f:019f"),
        Device::healthy("01:03-145f:019f")
      ]
    );

    stop.cancel();
    let last = updates.next().await.unwrap().unwrap();
    assert!(last.devices.is_empty());
    assert!(updates.next().await.is_none());
  }

  #[tokio::test]
  async fn plugin_start_fails_without_kubelet() {
    let dir = tempfile::tempdir().unwrap();
    let settings = UsbPluginSettings {
      plugin_dir: dir.path().to_owned(),
      kubelet_socket: dir.path().join("kubelet.sock"),
      host_root: dir.path().to_owned(),
      registration_timeout: Duration::from_secs(1),
    };
    let plugin = UsbPluginFactory::new(settings, Arc::new(RecordingChown::default()))
      .create("kubevirt.io/usb-storage", vec![device(2)]);

    assert_eq!(plugin.name(), "kubevirt.io/usb-storage");
    assert!(plugin.start(CancellationToken::new()).await.is_err());
  }

  mod kubelet {
    use super::*;
    use kubelet_deviceplugin_proto::{
      tonic::{
        self,
        transport::{Channel, Endpoint, Server, Uri},
      },
      v1beta1::proto::{
        device_plugin_client::DevicePluginClient,
        registration_server::{Registration, RegistrationServer},
        Empty, RegisterRequest,
      },
    };
    use tokio::{
      net::{UnixListener, UnixStream},
      sync::mpsc,
      time,
    };
    use tokio_stream::wrappers::UnixListenerStream;
    use tower::service_fn;

    struct FakeKubelet(mpsc::UnboundedSender<RegisterRequest>);

    #[async_trait]
    impl Registration for FakeKubelet {
      async fn register(
        &self,
        request: tonic::Request<RegisterRequest>,
      ) -> Result<tonic::Response<Empty>, Status> {
        let _ = self.0.send(request.into_inner());
        Ok(tonic::Response::new(Empty {}))
      }
    }

    struct Node {
      dir: tempfile::TempDir,
      registrations: mpsc::UnboundedReceiver<RegisterRequest>,
      fixture: Fixture,
    }

    impl Node {
      fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (sender, registrations) = mpsc::unbounded_channel();
        let listener = UnixListener::bind(dir.path().join("kubelet.sock")).unwrap();

        tokio::spawn(
          Server::builder()
            .add_service(RegistrationServer::new(FakeKubelet(sender)))
            .serve_with_incoming(UnixListenerStream::new(listener)),
        );

        Self {
          dir,
          registrations,
          fixture: Fixture::new(RecordingChown::default()),
        }
      }

      fn plugin(&self, resource_name: &str, devices: Vec<UsbDevice>) -> UsbDevicePlugin {
        let settings = UsbPluginSettings {
          plugin_dir: self.dir.path().to_owned(),
          kubelet_socket: self.dir.path().join("kubelet.sock"),
          host_root: self.fixture.host_root.path().to_owned(),
          registration_timeout: Duration::from_secs(5),
        };

        UsbDevicePlugin::new(resource_name, devices, settings, self.fixture.chown.clone())
      }
    }

    async fn connect(socket: PathBuf) -> DevicePluginClient<Channel> {
      let endpoint = Endpoint::from_static("http://[::]:50051");
      let channel = endpoint
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(socket.clone())))
        .await
        .unwrap();

      DevicePluginClient::new(channel)
    }

    fn ids(response: &kubelet_deviceplugin_proto::v1beta1::proto::ListAndWatchResponse) -> Vec<&str> {
      response.devices.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn serves_kubelet_until_stopped() {
      let mut node = Node::start();
      let plugin = node.plugin("kubevirt.io/usb-storage", vec![device(2)]);
      let stop = CancellationToken::new();

      plugin.start(stop.clone()).await.unwrap();
      assert_eq!(plugin.endpoint(), Some(plugin.socket_path()));

      let registration = node.registrations.recv().await.unwrap();
      assert_eq!(registration.version, "v1beta1");
      assert_eq!(registration.resource_name, "kubevirt.io/usb-storage");
      assert_eq!(
        plugin.socket_path().file_name(),
        Some(std::ffi::OsStr::new(&registration.endpoint))
      );

      let mut client = connect(plugin.socket_path()).await;
      let mut updates = client.list_and_watch(Empty {}).await.unwrap().into_inner();
      let first = updates.message().await.unwrap().unwrap();
      assert_eq!(ids(&first), ["01:02-145f:019f"]);
      assert!(first.devices.iter().all(|d| d.health == "Healthy"));

      stop.cancel();
      let last = updates.message().await.unwrap().unwrap();
      assert!(last.devices.is_empty());
      assert!(updates.message().await.unwrap().is_none());

      drop(updates);
      drop(client);
      time::timeout(Duration::from_secs(5), plugin.stopped())
        .await
        .expect("server stops after the stop token fires");
    }

    #[tokio::test]
    async fn resources_with_the_same_suffix_keep_their_devices() {
      let mut node = Node::start();
      let first = node.plugin("vendor-a.io/usb", vec![device(2)]);
      let second = node.plugin("vendor-b.io/usb", vec![device(3)]);
      assert_ne!(first.socket_path(), second.socket_path());

      let stop = CancellationToken::new();
      first.start(stop.clone()).await.unwrap();
      second.start(stop.clone()).await.unwrap();
      node.registrations.recv().await.unwrap();
      node.registrations.recv().await.unwrap();

      for (plugin, expected) in [(&first, "01:02-145f:019f"), (&second, "01:03-145f:019f")] {
        let mut client = connect(plugin.socket_path()).await;
        let mut updates = client.list_and_watch(Empty {}).await.unwrap().into_inner();
        let listed = updates.message().await.unwrap().unwrap();
        assert_eq!(ids(&listed), [expected]);
      }

      stop.cancel();
    }
  }
}
