pub mod proto;
mod types;

use async_trait::async_trait;
use futures::{future, stream::TryStream, Stream, TryStreamExt};
use hyper::{Server, Uri};
use std::{
  future::Future,
  path::{Path, PathBuf},
  pin::Pin,
  sync::Arc,
  time::Duration,
};
use thiserror::Error;
use tokio::{io, net::UnixStream, time};
use tonic::transport::Endpoint;
use tower::service_fn;
use tracing::{event, span, Instrument, Level, Span};

pub use types::*;

use crate::{
  server::KubernetesDevicePluginServer,
  transport::{Svc, UnixSocketListener},
};

/// Means that the device is healthy.
pub const HEALTHY: &str = "Healthy";

/// Means that the device is unhealthy.
pub const UNHEALTHY: &str = "Unhealthy";

/// Means current version of the API supported by kubelet.
pub const VERSION: &str = "v1beta1";

/// The folder the Device Plugin is expecting sockets to be on. Only
/// privileged pods have access to this path.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// The path of the kubelet registry socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Bound on dialing the kubelet and on the registration call itself.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// A device plugin serving one extended resource.
#[async_trait]
pub trait DevicePlugin: Send + Sync + 'static {
  type ListAndWatchStream: TryStream<Ok = ListAndWatchResponse, Error = tonic::Status>
    + Send
    + 'static;

  /// Whether the kubelet must call [`prestart_container`](Self::prestart_container)
  /// before each container start.
  const PRE_START_REQUIRED: bool = false;

  /// ListAndWatch returns a stream of List of Devices
  /// Whenever a Device state change or a Device disappears, ListAndWatch
  /// returns the new list
  async fn list_and_watch(&self) -> Result<Self::ListAndWatchStream, tonic::Status>;

  /// Allocate is called during container creation so that the Device
  /// Plugin can run device specific operations and instruct Kubelet
  /// of the steps to make the Device available in the container
  async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse, tonic::Status>;

  /// PreStartContainer is called, if indicated by Device Plugin during registeration phase,
  /// before each container start.
  async fn prestart_container(
    &self,
    _request: PreStartContainerRequest,
  ) -> Result<(), tonic::Status> {
    Ok(())
  }
}

/// Where a plugin listens and how it announces itself to the kubelet.
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
  resource_name: String,
  plugin_dir: PathBuf,
  socket_name: PathBuf,
  kubelet_socket: PathBuf,
  timeout: Duration,
}

impl RegistrationOptions {
  /// Options for `resource_name` listening on `socket_name` inside the
  /// kubelet's device plugin directory.
  pub fn new(resource_name: impl Into<String>, socket_name: impl Into<PathBuf>) -> Self {
    Self {
      resource_name: resource_name.into(),
      plugin_dir: PathBuf::from(DEVICE_PLUGIN_PATH),
      socket_name: socket_name.into(),
      kubelet_socket: PathBuf::from(KUBELET_SOCKET),
      timeout: REGISTRATION_TIMEOUT,
    }
  }

  pub fn with_plugin_dir(mut self, plugin_dir: impl Into<PathBuf>) -> Self {
    self.plugin_dir = plugin_dir.into();
    self
  }

  pub fn with_kubelet_socket(mut self, kubelet_socket: impl Into<PathBuf>) -> Self {
    self.kubelet_socket = kubelet_socket.into();
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn resource_name(&self) -> &str {
    &self.resource_name
  }

  pub fn socket_path(&self) -> PathBuf {
    self.plugin_dir.join(&self.socket_name)
  }

  pub fn kubelet_socket(&self) -> &Path {
    &self.kubelet_socket
  }

  /// The kubelet resolves the endpoint relative to its plugin directory.
  fn endpoint(&self) -> String {
    let socket_path = self.socket_path();
    socket_path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default()
  }
}

/// Serves a [`DevicePlugin`] as the kubelet's `v1beta1.DevicePlugin` gRPC service.
pub struct KubeletDevicePlugin<T: DevicePlugin>(Arc<T>);

impl<T: DevicePlugin> Clone for KubeletDevicePlugin<T> {
  fn clone(&self) -> Self {
    Self(self.0.clone())
  }
}

impl<T: DevicePlugin> KubeletDevicePlugin<T> {
  pub fn new(plugin: T) -> Self {
    Self(Arc::new(plugin))
  }

  pub fn from_arc(plugin: Arc<T>) -> Self {
    Self(plugin)
  }

  fn options() -> proto::DevicePluginOptions {
    proto::DevicePluginOptions {
      pre_start_required: T::PRE_START_REQUIRED,
      get_preferred_allocation_available: false,
    }
  }
}

type ListAndWatchProtoStream =
  dyn Stream<Item = Result<proto::ListAndWatchResponse, tonic::Status>> + Send + 'static;

#[async_trait]
impl<T: DevicePlugin> proto::device_plugin_server::DevicePlugin for KubeletDevicePlugin<T> {
  type ListAndWatchStream = Pin<Box<ListAndWatchProtoStream>>;

  async fn get_device_plugin_options(
    &self,
    _: tonic::Request<proto::Empty>,
  ) -> Result<tonic::Response<proto::DevicePluginOptions>, tonic::Status> {
    Ok(tonic::Response::new(Self::options()))
  }

  async fn list_and_watch(
    &self,
    _: tonic::Request<proto::Empty>,
  ) -> Result<tonic::Response<Self::ListAndWatchStream>, tonic::Status> {
    let inner_stream = <T as DevicePlugin>::list_and_watch(&self.0).await?;
    let mapped = inner_stream.map_ok(proto::ListAndWatchResponse::from);
    let boxed: Self::ListAndWatchStream = Box::pin(mapped);

    Ok(tonic::Response::new(boxed))
  }

  async fn get_preferred_allocation(
    &self,
    _: tonic::Request<proto::PreferredAllocationRequest>,
  ) -> Result<tonic::Response<proto::PreferredAllocationResponse>, tonic::Status> {
    Err(tonic::Status::unimplemented(
      "get_preferred_allocation not supported",
    ))
  }

  async fn allocate(
    &self,
    request: tonic::Request<proto::AllocateRequest>,
  ) -> Result<tonic::Response<proto::AllocateResponse>, tonic::Status> {
    let response = <T as DevicePlugin>::allocate(&self.0, request.into_inner().into()).await?;

    Ok(tonic::Response::new(proto::AllocateResponse::from(
      response,
    )))
  }

  async fn pre_start_container(
    &self,
    request: tonic::Request<proto::PreStartContainerRequest>,
  ) -> Result<tonic::Response<proto::PreStartContainerResponse>, tonic::Status> {
    <T as DevicePlugin>::prestart_container(&self.0, request.into_inner().into()).await?;

    Ok(tonic::Response::new(proto::PreStartContainerResponse {}))
  }
}

impl<T: DevicePlugin> KubeletDevicePlugin<T> {
  /// Binds the plugin socket, starts serving on it and registers the plugin
  /// with the kubelet.
  ///
  /// The server keeps running on its own task until `shutdown` resolves. If
  /// registration fails the server is stopped before the error is returned.
  pub async fn start<F>(
    self,
    options: RegistrationOptions,
    shutdown: F,
  ) -> Result<KubernetesDevicePluginServer, ConnectionError>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let span = span!(
      Level::INFO,
      "deviceplugin-v1beta1",
      resource = options.resource_name(),
    );

    self._start(options, shutdown).instrument(span).await
  }

  async fn _start<F>(
    self,
    options: RegistrationOptions,
    shutdown: F,
  ) -> Result<KubernetesDevicePluginServer, ConnectionError>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let socket_path = options.socket_path();
    let socket_listener = UnixSocketListener::rebind(&socket_path)?;

    let device_plugin_service = proto::device_plugin_server::DevicePluginServer::new(self);
    let span = Span::current();
    let shutdown = Box::pin(shutdown);
    let server = KubernetesDevicePluginServer::start(socket_path.clone(), move |abort| {
      let server = Server::builder(socket_listener)
        .http2_only(true)
        .serve(Svc::new(device_plugin_service, span))
        .with_graceful_shutdown(async move {
          future::select(abort, shutdown).await;
        });

      tokio::spawn(server)
    });

    event!(Level::DEBUG, socket = %socket_path.display(), "device plugin server listening");

    if let Err(error) = register(&options, Self::options()).await {
      event!(Level::WARN, ?error, "registration with kubelet failed, stopping server");
      if let Err(error) = server.abort().await {
        event!(Level::WARN, ?error, "device plugin server stopped with an error");
      }

      return Err(error);
    }

    event!(Level::INFO, socket = %socket_path.display(), "registered device plugin with kubelet");
    Ok(server)
  }
}

async fn register(
  options: &RegistrationOptions,
  plugin_options: proto::DevicePluginOptions,
) -> Result<(), ConnectionError> {
  let kubelet_socket = options.kubelet_socket().to_owned();
  // The URI is ignored, the connector always dials the kubelet socket.
  let endpoint = Endpoint::from_static("http://[::]:50051");
  let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
    UnixStream::connect(kubelet_socket.clone())
  }));
  let channel = time::timeout(options.timeout, connect).await??;

  let mut kubelet_client = proto::registration_client::RegistrationClient::new(channel);
  let request = proto::RegisterRequest {
    version: VERSION.into(),
    endpoint: options.endpoint(),
    resource_name: options.resource_name.clone(),
    options: Some(plugin_options),
  };

  time::timeout(options.timeout, kubelet_client.register(request)).await??;
  Ok(())
}

#[derive(Debug, Error)]
pub enum ConnectionError {
  #[error(transparent)]
  Transport(#[from] tonic::transport::Error),

  #[error(transparent)]
  Status(#[from] tonic::Status),

  #[error(transparent)]
  Io(#[from] io::Error),

  #[error(transparent)]
  Join(#[from] tokio::task::JoinError),

  #[error("timed out talking to the kubelet")]
  Timeout(#[from] time::error::Elapsed),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn registration_endpoint_is_socket_basename() {
    let options = RegistrationOptions::new("kubevirt.io/usb-storage", "usb-usb-storage.sock")
      .with_plugin_dir("/tmp/plugins");

    assert_eq!(
      options.socket_path(),
      PathBuf::from("/tmp/plugins/usb-usb-storage.sock")
    );
    assert_eq!(options.endpoint(), "usb-usb-storage.sock");
    assert_eq!(options.kubelet_socket(), Path::new(KUBELET_SOCKET));
  }
}
