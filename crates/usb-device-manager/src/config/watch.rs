use super::{Config, ConfigError, ConfigFormat};
use async_stream::stream;
use futures::{Stream, StreamExt};
use notify::{DebouncedEvent, RecursiveMode, Watcher as WatcherTrait};
use pin_project::pin_project;
use std::{
  ffi::OsStr,
  path::{Path, PathBuf},
  pin::Pin,
  task::{Context, Poll},
  time::Duration,
};
use thiserror::Error;
use tokio::{io, sync::mpsc::UnboundedReceiver};
use tracing::{event, Level};

const DEBOUNCE_DELAY: Duration = Duration::from_secs(2);

#[pin_project]
struct Watcher {
  watcher: notify::RecommendedWatcher,

  #[pin]
  receiver: UnboundedReceiver<DebouncedEvent>,
}

impl Watcher {
  fn new(delay: Duration) -> Result<Self, ConfigWatcherError> {
    let (std_sender, std_receiver) = std::sync::mpsc::channel();
    let (async_sender, async_receiver) = tokio::sync::mpsc::unbounded_channel();
    let watcher = notify::watcher(std_sender, delay)?;
    std::thread::Builder::new()
      .name("config-watcher-mpsc".into())
      .spawn(move || {
        for evt in std_receiver {
          if async_sender.send(evt).is_err() {
            break;
          }
        }
      })?;

    Ok(Self {
      watcher,
      receiver: async_receiver,
    })
  }

  fn watch(
    &mut self,
    path: impl AsRef<Path>,
    recursive_mode: RecursiveMode,
  ) -> Result<(), ConfigWatcherError> {
    Ok(self.watcher.watch(path, recursive_mode)?)
  }
}

impl Stream for Watcher {
  type Item = DebouncedEvent;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.receiver.poll_recv(cx)
  }
}

#[derive(Debug, Error)]
pub enum ConfigWatcherError {
  #[error(transparent)]
  Notify(#[from] notify::Error),

  #[error(transparent)]
  Io(#[from] io::Error),
}

/// The file that an event leaves behind, if any.
fn changed_path(event: DebouncedEvent) -> Option<PathBuf> {
  match event {
    DebouncedEvent::Write(path) | DebouncedEvent::Create(path) => Some(path),
    DebouncedEvent::Rename(_, to) => Some(to),
    _ => None,
  }
}

/// Config maps mounted as volumes swap their contents in by renaming this
/// symlink, so the watched file itself never shows up in an event.
const CONFIG_MAP_DATA: &str = "..data";

fn affects_config(changed: &Path, file_name: Option<&OsStr>) -> bool {
  match changed.file_name() {
    Some(name) => Some(name) == file_name || name == CONFIG_MAP_DATA,
    None => false,
  }
}

/// Yields a freshly read [`Config`] every time `file` is written or replaced.
///
/// The parent directory is watched rather than the file itself so that
/// editors and config map updates that swap the file in with a rename are
/// picked up as well.
pub fn watch(
  file: impl AsRef<Path>,
  format: ConfigFormat,
) -> Result<impl Stream<Item = Result<Config, ConfigError>>, ConfigWatcherError> {
  let file = file.as_ref().to_owned();
  let file_name = file.file_name().map(ToOwned::to_owned);
  let dir = match file.parent() {
    Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
    _ => PathBuf::from("."),
  };

  let mut watcher = Watcher::new(DEBOUNCE_DELAY)?;
  watcher.watch(&dir, RecursiveMode::NonRecursive)?;
  event!(target: "usb-device-manager", Level::DEBUG, path = %file.display(), "Watching config file");

  Ok(stream! {
    while let Some(event) = watcher.next().await {
      let changed = changed_path(event);
      if changed.map_or(false, |path| affects_config(&path, file_name.as_deref())) {
        yield Config::read(&file, format).await;
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{fs, os::unix::fs::symlink};

  #[test]
  fn only_content_changes_count() {
    let path = PathBuf::from("/etc/usb/config.yaml");

    assert_eq!(
      changed_path(DebouncedEvent::Write(path.clone())),
      Some(path.clone())
    );
    assert_eq!(
      changed_path(DebouncedEvent::Rename(PathBuf::from("/etc/usb/.tmp"), path.clone())),
      Some(path.clone())
    );
    assert_eq!(changed_path(DebouncedEvent::Chmod(path.clone())), None);
    assert_eq!(changed_path(DebouncedEvent::Remove(path)), None);
  }

  #[test]
  fn config_map_swaps_trigger_a_reload() {
    let file_name = Some(OsStr::new("config.yaml"));

    assert!(affects_config(Path::new("/etc/usb/config.yaml"), file_name));
    assert!(affects_config(Path::new("/etc/usb/..data"), file_name));
    assert!(!affects_config(Path::new("/etc/usb/..2026_10_19_12_00_00.1"), file_name));
    assert!(!affects_config(Path::new("/etc/usb/other.yaml"), file_name));
    assert!(!affects_config(Path::new("/"), file_name));
  }

  #[tokio::test]
  async fn reloads_when_config_map_data_is_swapped() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("..first");
    let second = dir.path().join("..second");
    fs::create_dir(&first).unwrap();
    fs::create_dir(&second).unwrap();
    fs::write(first.join("config.yaml"), "nodeConfigs: []").unwrap();
    fs::write(
      second.join("config.yaml"),
      "nodeConfigs:\n  - metadata:\n      name: node-a\n",
    )
    .unwrap();

    symlink("..first", dir.path().join("..data")).unwrap();
    symlink("..data/config.yaml", dir.path().join("config.yaml")).unwrap();

    let updates = watch(dir.path().join("config.yaml"), ConfigFormat::Yaml).unwrap();
    futures::pin_mut!(updates);

    // Same sequence as the kubelet: new symlink, then rename over `..data`.
    symlink("..second", dir.path().join("..data_tmp")).unwrap();
    fs::rename(dir.path().join("..data_tmp"), dir.path().join("..data")).unwrap();

    let config = tokio::time::timeout(Duration::from_secs(10), updates.next())
      .await
      .expect("reload after the swap")
      .unwrap()
      .unwrap();
    assert_eq!(config.node_configs().len(), 1);
    assert_eq!(config.node_configs()[0].metadata.name, "node-a");
  }
}
