use super::Plugin;
use futures::future::join_all;
use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{event, span, Instrument, Level};

/// How often and how long a plugin that fails to start is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt before the plugin is marked failed.
  pub max_retries: u32,
  pub interval: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 10,
      interval: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
  Starting,
  Started,
  Failed,
}

/// Shared view of a registered plugin.
#[derive(Clone)]
pub struct PluginHandle {
  name: Arc<str>,
  state: watch::Receiver<HandlerState>,
  stop: CancellationToken,
}

impl fmt::Debug for PluginHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct(stringify!(PluginHandle))
      .field("name", &self.name)
      .field("state", &self.state())
      .field("stopped", &self.is_stopped())
      .finish()
  }
}

impl PluginHandle {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> HandlerState {
    *self.state.borrow()
  }

  /// Cancels the plugin's stop token. Pending retries are abandoned and a
  /// running server shuts down.
  pub fn stop(&self) {
    self.stop.cancel();
  }

  pub fn is_stopped(&self) -> bool {
    self.stop.is_cancelled()
  }

  /// Waits until the handler reaches `state`. Returns `false` if the handler
  /// finished in another state.
  pub async fn wait_for(&self, state: HandlerState) -> bool {
    let mut receiver = self.state.clone();
    let reached = receiver.wait_for(|current| *current == state).await.is_ok();
    reached
  }
}

struct Handler {
  handle: PluginHandle,
  endpoint: Option<PathBuf>,
  task: Option<JoinHandle<()>>,
}

/// Registry of running plugins, one per resource name.
#[derive(Clone)]
pub struct PluginManager {
  handlers: Arc<Mutex<BTreeMap<String, Handler>>>,
  policy: RetryPolicy,
}

impl Default for PluginManager {
  fn default() -> Self {
    Self::new(RetryPolicy::default())
  }
}

impl fmt::Debug for PluginManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct(stringify!(PluginManager))
      .field("resources", &self.resource_names())
      .field("policy", &self.policy)
      .finish()
  }
}

impl PluginManager {
  pub fn new(policy: RetryPolicy) -> Self {
    Self {
      handlers: Arc::new(Mutex::new(BTreeMap::new())),
      policy,
    }
  }

  /// Registers `plugin` and starts it in the background. Returns `false`
  /// without doing anything when a plugin with the same name is registered,
  /// or when another plugin already serves on the same socket.
  pub fn start_plugin(&self, plugin: Arc<dyn Plugin>) -> bool {
    let name = plugin.name().to_owned();
    let endpoint = plugin.endpoint();
    let mut handlers = self.handlers.lock();
    if handlers.contains_key(&name) {
      event!(target: "usb-device-manager", Level::TRACE, resource = %name, "Usb plugin is already started");
      return false;
    }

    if let Some(endpoint) = &endpoint {
      let owner = handlers
        .iter()
        .find(|(_, handler)| handler.endpoint.as_ref() == Some(endpoint));

      if let Some((owner, _)) = owner {
        event!(
          target: "usb-device-manager",
          Level::ERROR,
          resource = %name,
          owner = %owner,
          socket = %endpoint.display(),
          "Usb plugin socket is already in use"
        );
        return false;
      }
    }

    event!(target: "usb-device-manager", Level::INFO, resource = %name, "Usb plugin starting");
    let (state, receiver) = watch::channel(HandlerState::Starting);
    let stop = CancellationToken::new();
    let span = span!(target: "usb-device-manager", Level::INFO, "usb-plugin", resource = %name);
    let task = tokio::spawn(run_plugin(plugin, self.policy, stop.clone(), state).instrument(span));

    let handle = PluginHandle {
      name: Arc::from(name.as_str()),
      state: receiver,
      stop,
    };

    handlers.insert(
      name,
      Handler {
        handle,
        endpoint,
        task: Some(task),
      },
    );

    true
  }

  pub fn handler(&self, name: &str) -> Option<PluginHandle> {
    self
      .handlers
      .lock()
      .get(name)
      .map(|handler| handler.handle.clone())
  }

  pub fn contains(&self, name: &str) -> bool {
    self.handlers.lock().contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.handlers.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.lock().is_empty()
  }

  pub fn resource_names(&self) -> Vec<String> {
    self.handlers.lock().keys().cloned().collect()
  }

  /// Stops every plugin and waits for their tasks to finish. Handlers stay
  /// registered.
  pub async fn stop_all(&self) {
    let tasks = {
      let mut handlers = self.handlers.lock();
      handlers
        .values_mut()
        .filter_map(|handler| {
          handler.handle.stop();
          handler.task.take()
        })
        .collect::<Vec<_>>()
    };

    for result in join_all(tasks).await {
      if let Err(error) = result {
        event!(target: "usb-device-manager", Level::ERROR, ?error, "Usb plugin task failed");
      }
    }
  }
}

async fn run_plugin(
  plugin: Arc<dyn Plugin>,
  policy: RetryPolicy,
  stop: CancellationToken,
  state: watch::Sender<HandlerState>,
) {
  let mut retries = 0u32;
  loop {
    match plugin.start(stop.clone()).await {
      Ok(()) => {
        event!(target: "usb-device-manager", Level::INFO, "Started usb plugin");
        state.send_replace(HandlerState::Started);
        break;
      }

      Err(error) => {
        retries += 1;
        if retries > policy.max_retries {
          event!(target: "usb-device-manager", Level::ERROR, error = %error, attempts = retries, "Unable to start usb plugin, giving up");
          state.send_replace(HandlerState::Failed);
          return;
        }

        event!(target: "usb-device-manager", Level::WARN, error = %error, retry = retries, "Error starting usb plugin");
      }
    }

    tokio::select! {
      _ = stop.cancelled() => {
        event!(target: "usb-device-manager", Level::INFO, "Usb plugin start cancelled");
        return;
      }
      _ = time::sleep(policy.interval) => {}
    }
  }

  plugin.stopped().await;
  event!(target: "usb-device-manager", Level::DEBUG, "Usb plugin stopped");
}
