use super::NodeConfig;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

/// A change observed when the store contents are replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  Added(Arc<NodeConfig>),
  Updated {
    old: Arc<NodeConfig>,
    new: Arc<NodeConfig>,
  },
  Deleted(Arc<NodeConfig>),
}

impl StoreEvent {
  /// The object the event is about, in its latest known state.
  pub fn object(&self) -> &NodeConfig {
    match self {
      StoreEvent::Added(config) | StoreEvent::Deleted(config) => config,
      StoreEvent::Updated { new, .. } => new,
    }
  }

  pub fn key(&self) -> String {
    self.object().key()
  }
}

/// Keyed, read-only view of the node configurations currently loaded.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
  objects: Arc<RwLock<BTreeMap<String, Arc<NodeConfig>>>>,
}

impl ConfigStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Swaps in a new set of objects and reports what changed, ordered by key.
  /// When several objects share a key the last one wins.
  pub fn replace(&self, configs: impl IntoIterator<Item = NodeConfig>) -> Vec<StoreEvent> {
    let mut next = BTreeMap::new();
    for config in configs {
      next.insert(config.key(), config);
    }

    let mut objects = self.objects.write();
    let mut events = Vec::new();
    let mut snapshot = BTreeMap::new();
    for (key, config) in next {
      let object = match objects.get(&key) {
        Some(old) if **old == config => old.clone(),
        Some(old) => {
          let new = Arc::new(config);
          events.push(StoreEvent::Updated {
            old: old.clone(),
            new: new.clone(),
          });
          new
        }
        None => {
          let new = Arc::new(config);
          events.push(StoreEvent::Added(new.clone()));
          new
        }
      };

      snapshot.insert(key, object);
    }

    for (key, old) in objects.iter() {
      if !snapshot.contains_key(key) {
        events.push(StoreEvent::Deleted(old.clone()));
      }
    }

    *objects = snapshot;
    drop(objects);

    events.sort_by_key(StoreEvent::key);
    events
  }

  pub fn get(&self, key: &str) -> Option<Arc<NodeConfig>> {
    self.objects.read().get(key).cloned()
  }

  pub fn keys(&self) -> Vec<String> {
    self.objects.read().keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.objects.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.objects.read().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{NodeConfigSpec, ObjectMeta, Usb};

  fn config(name: &str, resources: &[&str]) -> NodeConfig {
    NodeConfig {
      metadata: ObjectMeta {
        namespace: Some("test".into()),
        name: name.into(),
      },
      spec: NodeConfigSpec {
        usb: resources
          .iter()
          .map(|resource| Usb {
            resource_name: (*resource).into(),
            usb_host_devices: vec![],
          })
          .collect(),
      },
    }
  }

  fn summary(events: &[StoreEvent]) -> Vec<(&'static str, String)> {
    events
      .iter()
      .map(|event| {
        let kind = match event {
          StoreEvent::Added(_) => "added",
          StoreEvent::Updated { .. } => "updated",
          StoreEvent::Deleted(_) => "deleted",
        };
        (kind, event.key())
      })
      .collect()
  }

  #[test]
  fn replace_reports_changes_in_key_order() {
    let store = ConfigStore::new();

    let events = store.replace(vec![config("b", &["x"]), config("a", &["x"])]);
    assert_eq!(
      summary(&events),
      vec![("added", "test/a".into()), ("added", "test/b".into())]
    );

    let events = store.replace(vec![config("a", &["x"]), config("b", &["y"]), config("c", &[])]);
    assert_eq!(
      summary(&events),
      vec![("updated", "test/b".into()), ("added", "test/c".into())]
    );

    let events = store.replace(vec![config("c", &[])]);
    assert_eq!(
      summary(&events),
      vec![("deleted", "test/a".into()), ("deleted", "test/b".into())]
    );
    assert_eq!(store.keys(), vec!["test/c".to_owned()]);
  }

  #[test]
  fn unchanged_objects_keep_their_handle() {
    let store = ConfigStore::new();
    store.replace(vec![config("a", &["x"])]);
    let before = store.get("test/a").unwrap();

    assert!(store.replace(vec![config("a", &["x"])]).is_empty());
    assert!(Arc::ptr_eq(&before, &store.get("test/a").unwrap()));
  }

  #[test]
  fn last_duplicate_wins() {
    let store = ConfigStore::new();
    let events = store.replace(vec![config("a", &["x"]), config("a", &["y"])]);

    assert_eq!(events.len(), 1);
    assert_eq!(store.len(), 1);
    assert_eq!(
      store.get("test/a").unwrap().spec.usb[0].resource_name,
      "y"
    );
    assert!(store.get("test/missing").is_none());
  }
}
