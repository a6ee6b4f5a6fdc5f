use super::proto;
use std::collections::HashMap;

/// Conversion between the generated prost messages and the wrappers below. A plain
/// `Into` can't be used because of the orphan rules for `Vec<T>` and `Option<T>`.
trait IntoWire<T> {
  fn into_wire(self) -> T;
}

macro_rules! identity_wire {
  ($($name:ty)+) => {
    $(
      impl IntoWire<$name> for $name {
        #[inline]
        fn into_wire(self) -> $name {
          self
        }
      }
    )*
  };
}

identity_wire!(bool i32 i64 String Vec<String> HashMap<String, String>);

macro_rules! nested_wire {
  ($name:ident) => {
    impl IntoWire<Option<$name>> for Option<proto::$name> {
      fn into_wire(self) -> Option<$name> {
        self.map(Into::into)
      }
    }

    impl IntoWire<Option<proto::$name>> for Option<$name> {
      fn into_wire(self) -> Option<proto::$name> {
        self.map(Into::into)
      }
    }

    impl IntoWire<Vec<$name>> for Vec<proto::$name> {
      fn into_wire(self) -> Vec<$name> {
        self.into_iter().map(Into::into).collect()
      }
    }

    impl IntoWire<Vec<proto::$name>> for Vec<$name> {
      fn into_wire(self) -> Vec<proto::$name> {
        self.into_iter().map(Into::into).collect()
      }
    }
  };
}

/// Generates `From` in both directions between a wrapper and its prost message.
/// `field: wire_name` maps a field whose generated name differs.
macro_rules! wire_message {
  ($name:ident { $($mapping:tt)+ }) => {
    impl From<proto::$name> for $name {
      fn from(value: proto::$name) -> Self {
        wire_message!(@from value [$($mapping)+] [])
      }
    }

    impl From<$name> for proto::$name {
      fn from(value: $name) -> Self {
        wire_message!(@to value [$($mapping)+] [])
      }
    }

    nested_wire!($name);
  };

  (@from $value:ident [] [$($acc:tt)*]) => {
    Self { $($acc)* }
  };

  (@from $value:ident [$fld:ident : $wire:ident $(, $($rest:tt)*)?] [$($acc:tt)*]) => {
    wire_message!(@from $value [$($($rest)*)?] [$($acc)* $fld: $value.$wire.into_wire(),])
  };

  (@from $value:ident [$fld:ident $(, $($rest:tt)*)?] [$($acc:tt)*]) => {
    wire_message!(@from $value [$($($rest)*)?] [$($acc)* $fld: $value.$fld.into_wire(),])
  };

  (@to $value:ident [] [$($acc:tt)*]) => {
    Self { $($acc)* }
  };

  (@to $value:ident [$fld:ident : $wire:ident $(, $($rest:tt)*)?] [$($acc:tt)*]) => {
    wire_message!(@to $value [$($($rest)*)?] [$($acc)* $wire: $value.$fld.into_wire(),])
  };

  (@to $value:ident [$fld:ident $(, $($rest:tt)*)?] [$($acc:tt)*]) => {
    wire_message!(@to $value [$($($rest)*)?] [$($acc)* $fld: $value.$fld.into_wire(),])
  };
}

/// ListAndWatch returns a stream of List of Devices
/// Whenever a Device state change or a Device disappears, ListAndWatch
/// returns the new list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListAndWatchResponse {
  pub devices: Vec<Device>,
}
wire_message!(ListAndWatchResponse { devices });

#[derive(Debug, Clone, PartialEq)]
pub struct TopologyInfo {
  pub nodes: Vec<NumaNode>,
}
wire_message!(TopologyInfo { nodes });

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaNode {
  pub id: i64,
}
wire_message!(NumaNode { id });

/// A single device advertised to the kubelet.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
  /// A unique ID assigned by the device plugin used
  /// to identify devices during the communication
  /// Max length of this field is 63 characters
  pub id: String,
  pub health: DeviceHealth,
  pub topology: Option<TopologyInfo>,
}
wire_message!(Device {
  id,
  health,
  topology,
});

impl Device {
  pub fn healthy(id: impl Into<String>) -> Self {
    Device {
      id: id.into(),
      health: DeviceHealth::Healthy,
      topology: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceHealth {
  Healthy,
  Unhealthy,
  Other(String),
}

impl IntoWire<DeviceHealth> for String {
  fn into_wire(self) -> DeviceHealth {
    match &*self {
      super::HEALTHY => DeviceHealth::Healthy,
      super::UNHEALTHY => DeviceHealth::Unhealthy,
      _ => DeviceHealth::Other(self),
    }
  }
}

impl IntoWire<String> for DeviceHealth {
  fn into_wire(self) -> String {
    match self {
      DeviceHealth::Healthy => super::HEALTHY.into(),
      DeviceHealth::Unhealthy => super::UNHEALTHY.into(),
      DeviceHealth::Other(v) => v,
    }
  }
}

/// Sent before each container start when the plugin registered with
/// `pre_start_required`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreStartContainerRequest {
  pub devices_ids: Vec<String>,
}
wire_message!(PreStartContainerRequest {
  devices_ids: devices_i_ds,
});

/// Sent during pod creation; one entry per container that requested devices
/// of the plugin's resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocateRequest {
  pub container_requests: Vec<ContainerAllocateRequest>,
}
wire_message!(AllocateRequest { container_requests });

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerAllocateRequest {
  pub devices_ids: Vec<String>,
}
wire_message!(ContainerAllocateRequest {
  devices_ids: devices_i_ds,
});

/// The kubelet expects exactly one container response per container request,
/// in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocateResponse {
  pub container_responses: Vec<ContainerAllocateResponse>,
}
wire_message!(AllocateResponse {
  container_responses,
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerAllocateResponse {
  /// List of environment variable to be set in the container to access one of more devices.
  pub envs: HashMap<String, String>,
  /// Mounts for the container.
  pub mounts: Vec<Mount>,
  /// Devices for the container.
  pub devices: Vec<DeviceSpec>,
  /// Container annotations to pass to the container runtime
  pub annotations: HashMap<String, String>,
}
wire_message!(ContainerAllocateResponse {
  envs,
  mounts,
  devices,
  annotations,
});

/// Mount specifies a host volume to mount into a container.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
  pub container_path: String,
  pub host_path: String,
  pub read_only: bool,
}
wire_message!(Mount {
  container_path,
  host_path,
  read_only,
});

/// DeviceSpec specifies a host device to mount into a container.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
  /// Path of the device within the container.
  pub container_path: String,
  /// Path of the device on the host.
  pub host_path: String,
  /// Cgroups permissions of the device, candidates are one or more of
  /// * r - allows container to read from the specified device.
  /// * w - allows container to write to the specified device.
  /// * m - allows container to create device files that do not yet exist.
  pub permissions: String,
}
wire_message!(DeviceSpec {
  container_path,
  host_path,
  permissions,
});
