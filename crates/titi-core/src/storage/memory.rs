use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use anyhow::anyhow;
use tracing::{debug, trace};

use super::{KvBackend, StorageEvent};

#[derive(Debug, Default)]
struct Shared {
    items: HashMap<String, String>,
    quota_bytes: Option<usize>,
    next_context: usize,
    queues: HashMap<usize, VecDeque<StorageEvent>>,
}

impl Shared {
    fn used_bytes_without(&self, key: &str) -> usize {
        self.items
            .iter()
            .filter(|(existing, _)| existing.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

/// In-process storage shared by any number of contexts.
///
/// Each handle returned by [`MemoryStorage::context`] behaves like a
/// separate browser tab on the same origin.
#[derive(Debug)]
pub struct MemoryStorage {
    shared: Rc<RefCell<Shared>>,
    context: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let shared = Rc::new(RefCell::new(Shared::default()));
        Self::attach(shared)
    }

    /// Storage that rejects writes once keys plus values exceed
    /// `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        let storage = Self::new();
        storage.shared.borrow_mut().quota_bytes = Some(quota_bytes);
        storage
    }

    /// Another context over the same items.
    pub fn context(&self) -> Self {
        Self::attach(Rc::clone(&self.shared))
    }

    fn attach(shared: Rc<RefCell<Shared>>) -> Self {
        let context = {
            let mut state = shared.borrow_mut();
            let context = state.next_context;
            state.next_context += 1;
            state.queues.insert(context, VecDeque::new());
            context
        };
        debug!(context, "attached memory storage context");
        Self { shared, context }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.shared.borrow_mut().queues.remove(&self.context);
    }
}

impl KvBackend for MemoryStorage {
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.shared.borrow().items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut state = self.shared.borrow_mut();
        if let Some(quota) = state.quota_bytes {
            let needed = state.used_bytes_without(key) + key.len() + value.len();
            if needed > quota {
                return Err(anyhow!(
                    "storage quota exceeded writing {key}: {needed} > {quota} bytes"
                ));
            }
        }

        if state.items.get(key).map(String::as_str) == Some(value) {
            trace!(key, "value unchanged; no event");
            return Ok(());
        }
        state.items.insert(key.to_string(), value.to_string());

        let origin = self.context;
        for (context, queue) in state.queues.iter_mut() {
            if *context != origin {
                queue.push_back(StorageEvent {
                    key: key.to_string(),
                    new_value: Some(value.to_string()),
                });
            }
        }
        trace!(key, bytes = value.len(), "stored item");
        Ok(())
    }

    fn drain_events(&self) -> Vec<StorageEvent> {
        self.shared
            .borrow_mut()
            .queues
            .get_mut(&self.context)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }
}
