//! Kubelet device plugin API: generated gRPC bindings plus a small runtime that
//! serves a plugin over its unix socket and registers it with the kubelet.

mod server;
pub(crate) mod transport;

#[cfg(feature = "v1beta1")]
pub mod v1beta1;

pub use server::KubernetesDevicePluginServer;
pub use tonic;
