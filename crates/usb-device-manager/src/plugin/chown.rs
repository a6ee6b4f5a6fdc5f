use std::{io, os::unix::fs::lchown, path::Path};

/// Uid and gid of the unprivileged user that runs the VM processes.
pub const NON_ROOT_UID: u32 = 107;

/// Changes the owner of a device node handed to a container.
pub trait Chown: Send + Sync {
  fn chown(&self, path: &Path) -> io::Result<()>;
}

/// Changes ownership on the host filesystem. Symlinks are not followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostChown {
  uid: u32,
  gid: u32,
}

impl HostChown {
  pub fn new(uid: u32, gid: u32) -> Self {
    Self { uid, gid }
  }
}

impl Default for HostChown {
  fn default() -> Self {
    Self::new(NON_ROOT_UID, NON_ROOT_UID)
  }
}

impl Chown for HostChown {
  fn chown(&self, path: &Path) -> io::Result<()> {
    lchown(path, Some(self.uid), Some(self.gid))
  }
}
