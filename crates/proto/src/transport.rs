// hyper is driven directly (instead of tonic's server) so the plugin controls
// the unix listener lifecycle and the graceful shutdown signal.

use futures::{
  future::{ready, Ready},
  Stream,
};
use hyper::{server::accept::Accept, Body, Request, Response};
use std::{
  convert::Infallible,
  fs,
  io::{self, IoSlice},
  path::Path,
  pin::Pin,
  task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::body::BoxBody;
use tower::Service;
use tracing::{event, instrument::Instrumented, Instrument, Level, Span};

pub struct UnixSocketListener(UnixListenerStream);
pub struct UnixSocket(tokio::net::UnixStream);

impl UnixSocketListener {
  /// Binds a listener at `path`, replacing a socket file left behind by a
  /// previous run.
  pub fn rebind<P>(path: P) -> io::Result<Self>
  where
    P: AsRef<Path>,
  {
    let path = path.as_ref();
    match fs::remove_file(path) {
      Ok(()) => {
        event!(Level::DEBUG, socket = %path.display(), "removed stale socket");
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(e),
    }

    let listener = tokio::net::UnixListener::bind(path)?;
    Ok(Self(UnixListenerStream::new(listener)))
  }
}

impl Accept for UnixSocketListener {
  type Conn = UnixSocket;
  type Error = io::Error;

  fn poll_accept(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
    self.poll_next(cx)
  }
}

impl Stream for UnixSocketListener {
  type Item = io::Result<UnixSocket>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    Pin::new(&mut self.0)
      .poll_next(cx)
      .map(|next| next.map(|conn| conn.map(UnixSocket)))
  }
}

impl AsyncRead for UnixSocket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.0).poll_read(cx, buf)
  }
}

impl AsyncWrite for UnixSocket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, io::Error>> {
    Pin::new(&mut self.0).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    Pin::new(&mut self.0).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    Pin::new(&mut self.0).poll_shutdown(cx)
  }

  fn poll_write_vectored(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    bufs: &[IoSlice<'_>],
  ) -> Poll<Result<usize, io::Error>> {
    Pin::new(&mut self.0).poll_write_vectored(cx, bufs)
  }

  fn is_write_vectored(&self) -> bool {
    self.0.is_write_vectored()
  }
}

/// Wraps a generated gRPC service so every request runs inside the plugin's span.
/// It doubles as the per-connection make-service handed to hyper.
#[derive(Clone)]
pub(crate) struct Svc<S> {
  inner: S,
  span: Span,
}

impl<S> Svc<S>
where
  S: Service<Request<Body>, Response = Response<BoxBody>, Error = Infallible>,
{
  pub fn new(service: S, span: Span) -> Self {
    Self {
      inner: service,
      span,
    }
  }
}

impl<S> Service<Request<Body>> for Svc<S>
where
  S: Service<Request<Body>, Response = Response<BoxBody>, Error = Infallible>,
{
  type Response = Response<BoxBody>;
  type Error = Infallible;
  type Future = Instrumented<S::Future>;

  fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    self.inner.poll_ready(cx)
  }

  fn call(&mut self, req: Request<Body>) -> Self::Future {
    self.inner.call(req).instrument(self.span.clone())
  }
}

impl<'a, S> Service<&'a UnixSocket> for Svc<S>
where
  S: Service<Request<Body>, Response = Response<BoxBody>, Error = Infallible> + Clone,
{
  type Response = Self;
  type Error = Infallible;
  type Future = Ready<Result<Self::Response, Self::Error>>;

  fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    Poll::Ready(Ok(()))
  }

  fn call(&mut self, _: &'a UnixSocket) -> Self::Future {
    ready(Ok(self.clone()))
  }
}
