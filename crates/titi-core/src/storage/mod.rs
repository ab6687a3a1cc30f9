//! Durable key-value storage.
//!
//! A [`KvBackend`] is the raw string store shared between execution
//! contexts (browser tabs, CLI processes). [`Persisted`] binds one typed
//! in-memory value to one key with debounced writes.

mod file;
mod memory;
mod persisted;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use persisted::{DEFAULT_DEBOUNCE_MS, Persisted};

pub const TODOS_KEY: &str = "todos";
pub const PROJECTS_KEY: &str = "projects";
pub const SELECTED_PROJECT_KEY: &str = "selectedProjectId";
pub const VIEW_MODE_KEY: &str = "viewMode";
pub const SEARCH_QUERY_KEY: &str = "searchQuery";

/// A change to a key made by another execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

pub trait KvBackend {
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Changes made by other contexts since the previous call. Writes made
    /// through this handle are never reported back to it.
    fn drain_events(&self) -> Vec<StorageEvent>;
}
