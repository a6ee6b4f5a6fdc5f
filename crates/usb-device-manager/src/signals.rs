use futures::{future::ready, Stream, StreamExt};
use signal_hook_tokio::Signals;
use std::{convert::TryFrom, fmt, io};
use thiserror::Error;
use tracing::{event, Level};

macro_rules! process_signals {
  (
    pub enum $name:ident {
      $($case:ident = $val:ident),+
      $(,)?
    }
  ) => {
    #[repr(i32)]
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub enum $name {
      $($case = ::signal_hook::consts::$val,)+
    }

    impl TryFrom<i32> for $name {
      type Error = i32;

      fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
          $(::signal_hook::consts::$val => Ok(Self::$case),)+
          other => Err(other),
        }
      }
    }

    impl $name {
      const ALL: &'static [i32] = &[$(::signal_hook::consts::$val,)+];

      pub fn name(self) -> &'static str {
        match self {
          $(Self::$case => stringify!($val),)+
        }
      }
    }
  };
}

process_signals! {
  pub enum Signal {
    SigTerm = SIGTERM,
    SigInt = SIGINT,
    SigQuit = SIGQUIT,
    SigHup = SIGHUP,
  }
}

impl fmt::Debug for Signal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl fmt::Display for Signal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Debug, Error)]
pub enum SignalWatchError {
  #[error("failed to register signal handlers")]
  Io(#[from] io::Error),
}

impl Signal {
  /// SIGHUP reloads the configuration, everything else stops the manager.
  pub fn is_reload(self) -> bool {
    self == Signal::SigHup
  }

  pub fn watch() -> Result<impl Stream<Item = Signal>, SignalWatchError> {
    let signals = Signals::new(Self::ALL)?;
    event!(target: "usb-device-manager", Level::DEBUG, "Started listening for process signals");

    Ok(signals.filter_map(|s| ready(Signal::try_from(s).ok())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use signal_hook::consts::{SIGHUP, SIGTERM, SIGUSR1};

  #[test]
  fn maps_known_signals() {
    assert_eq!(Signal::try_from(SIGTERM), Ok(Signal::SigTerm));
    assert_eq!(Signal::try_from(SIGUSR1), Err(SIGUSR1));
    assert_eq!(Signal::SigHup.to_string(), "SIGHUP");
    assert_eq!(Signal::ALL.len(), 4);
  }

  #[test]
  fn only_hangup_reloads() {
    assert!(Signal::try_from(SIGHUP).unwrap().is_reload());
    assert!(!Signal::SigInt.is_reload());
    assert!(!Signal::SigQuit.is_reload());
  }
}
