use futures::{
  future::{Fuse, FusedFuture},
  FutureExt,
};
use pin_project::pin_project;
use static_assertions::assert_impl_all;
use std::{
  fmt,
  future::Future,
  panic,
  path::{Path, PathBuf},
  pin::Pin,
  task::{Context, Poll},
};
use tokio::{
  sync::oneshot::{self, Sender},
  task::JoinHandle,
};

/// Resolves once the owning [`KubernetesDevicePluginServer`] is aborted or dropped.
#[pin_project]
pub(crate) struct AbortSignal(#[pin] oneshot::Receiver<()>);

impl Future for AbortSignal {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match self.project().0.poll(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(_) => Poll::Ready(()),
    }
  }
}

/// Handle to a device plugin gRPC server running on its own task.
///
/// Awaiting the handle waits for the server to stop; it stops when the shutdown
/// future given at start resolves or when [`abort`](Self::abort) is called.
pub struct KubernetesDevicePluginServer {
  socket_path: PathBuf,
  abort_channel: Sender<()>,
  handle: Fuse<JoinHandle<hyper::Result<()>>>,
}

assert_impl_all!(KubernetesDevicePluginServer: Unpin, Send);

impl fmt::Debug for KubernetesDevicePluginServer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct(stringify!(KubernetesDevicePluginServer))
      .field("socket_path", &self.socket_path)
      .finish_non_exhaustive()
  }
}

impl KubernetesDevicePluginServer {
  pub(crate) fn start(
    socket_path: PathBuf,
    f: impl FnOnce(AbortSignal) -> JoinHandle<hyper::Result<()>>,
  ) -> Self {
    let (abort_channel, receiver) = oneshot::channel::<()>();
    let handle = f(AbortSignal(receiver)).fuse();

    Self {
      socket_path,
      abort_channel,
      handle,
    }
  }

  /// The unix socket the server is bound to.
  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  /// Stops accepting requests and waits for open connections to finish.
  pub async fn abort(self) -> hyper::Result<()> {
    if self.is_terminated() {
      return Ok(());
    }

    let _ = self.abort_channel.send(());

    match self.handle.await {
      Ok(result) => result,
      Err(e) if e.is_cancelled() => Ok(()),
      Err(e) => panic::resume_unwind(e.into_panic()),
    }
  }

  pub fn is_terminated(&self) -> bool {
    self.handle.is_terminated()
  }
}

impl Future for KubernetesDevicePluginServer {
  type Output = hyper::Result<()>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match self.get_mut().handle.poll_unpin(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(result) => match result {
        Ok(result) => Poll::Ready(result),
        Err(e) if e.is_cancelled() => Poll::Ready(Ok(())),
        Err(e) => panic::resume_unwind(e.into_panic()),
      },
    }
  }
}

impl FusedFuture for KubernetesDevicePluginServer {
  fn is_terminated(&self) -> bool {
    self.is_terminated()
  }
}
