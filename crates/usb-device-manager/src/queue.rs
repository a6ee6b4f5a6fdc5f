use parking_lot::Mutex;
use std::{
  collections::{HashMap, HashSet, VecDeque},
  fmt,
  hash::Hash,
  sync::Arc,
  time::Duration,
};
use tokio::{sync::Notify, time};

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
  pub base: Duration,
  pub max: Duration,
}

impl Default for ExponentialBackoff {
  fn default() -> Self {
    Self {
      base: Duration::from_millis(5),
      max: Duration::from_secs(1000),
    }
  }
}

impl ExponentialBackoff {
  pub fn delay(&self, failures: u32) -> Duration {
    2u32
      .checked_pow(failures)
      .and_then(|factor| self.base.checked_mul(factor))
      .map_or(self.max, |delay| delay.min(self.max))
  }
}

struct State<T> {
  queue: VecDeque<T>,
  dirty: HashSet<T>,
  processing: HashSet<T>,
  failures: HashMap<T, u32>,
  shutting_down: bool,
}

struct Inner<T> {
  state: Mutex<State<T>>,
  ready: Notify,
  backoff: ExponentialBackoff,
}

/// A deduplicating work queue with rate-limited re-adds.
///
/// An item is queued at most once at a time, and an item handed out by
/// [`get`](Self::get) is not handed out again until [`done`](Self::done) is
/// called for it. Adding it meanwhile marks it to be queued again on `done`.
pub struct WorkQueue<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> fmt::Debug for WorkQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct(stringify!(WorkQueue))
      .field("len", &state.queue.len())
      .field("processing", &state.processing.len())
      .field("shutting_down", &state.shutting_down)
      .finish()
  }
}

impl<T> Default for WorkQueue<T>
where
  T: Clone + Eq + Hash + Send + 'static,
{
  fn default() -> Self {
    Self::new(ExponentialBackoff::default())
  }
}

impl<T> WorkQueue<T>
where
  T: Clone + Eq + Hash + Send + 'static,
{
  pub fn new(backoff: ExponentialBackoff) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          queue: VecDeque::new(),
          dirty: HashSet::new(),
          processing: HashSet::new(),
          failures: HashMap::new(),
          shutting_down: false,
        }),
        ready: Notify::new(),
        backoff,
      }),
    }
  }

  pub fn add(&self, item: T) {
    let mut state = self.inner.state.lock();
    if state.shutting_down || state.dirty.contains(&item) {
      return;
    }

    state.dirty.insert(item.clone());
    if state.processing.contains(&item) {
      return;
    }

    state.queue.push_back(item);
    drop(state);
    self.inner.ready.notify_one();
  }

  /// Waits for the next item. Returns `None` once the queue is shut down and
  /// drained.
  pub async fn get(&self) -> Option<T> {
    loop {
      let ready = self.inner.ready.notified();
      {
        let mut state = self.inner.state.lock();
        if let Some(item) = state.queue.pop_front() {
          state.dirty.remove(&item);
          state.processing.insert(item.clone());
          return Some(item);
        }

        if state.shutting_down {
          return None;
        }
      }

      ready.await;
    }
  }

  /// Marks `item` as no longer being processed.
  pub fn done(&self, item: &T) {
    let mut state = self.inner.state.lock();
    state.processing.remove(item);
    if state.dirty.contains(item) {
      state.queue.push_back(item.clone());
      drop(state);
      self.inner.ready.notify_one();
    }
  }

  /// Adds `item` again once its backoff has elapsed.
  pub fn add_rate_limited(&self, item: T) {
    let delay = {
      let mut state = self.inner.state.lock();
      if state.shutting_down {
        return;
      }

      let failures = state.failures.entry(item.clone()).or_insert(0);
      let delay = self.inner.backoff.delay(*failures);
      *failures += 1;
      delay
    };

    let queue = self.clone();
    tokio::spawn(async move {
      time::sleep(delay).await;
      queue.add(item);
    });
  }

  /// Clears the failure history of `item`.
  pub fn forget(&self, item: &T) {
    self.inner.state.lock().failures.remove(item);
  }

  pub fn num_requeues(&self, item: &T) -> u32 {
    self
      .inner
      .state
      .lock()
      .failures
      .get(item)
      .copied()
      .unwrap_or(0)
  }

  /// Number of items waiting to be handed out.
  pub fn len(&self) -> usize {
    self.inner.state.lock().queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn shut_down(&self) {
    self.inner.state.lock().shutting_down = true;
    self.inner.ready.notify_waiters();
  }

  pub fn is_shutting_down(&self) -> bool {
    self.inner.state.lock().shutting_down
  }
}
