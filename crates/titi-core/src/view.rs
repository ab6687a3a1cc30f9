use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::datetime::Clock;
use crate::model::{Project, Todo, ViewMode};
use crate::storage::{
    KvBackend, Persisted, SEARCH_QUERY_KEY, SELECTED_PROJECT_KEY, StorageEvent, VIEW_MODE_KEY,
};

struct ViewState {
    view_mode: Persisted<ViewMode>,
    selected_project: Persisted<Option<String>>,
    search_query: Persisted<String>,
}

impl ViewState {
    fn earliest_write(&self) -> Option<DateTime<Utc>> {
        [
            self.view_mode.write_due(),
            self.selected_project.write_due(),
            self.search_query.write_due(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Navigation state: active view, selected project and search text. Each
/// value lives under its own storage key.
#[derive(Clone)]
pub struct ViewStore {
    state: Rc<RefCell<ViewState>>,
    clock: Rc<dyn Clock>,
}

impl fmt::Debug for ViewStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewStore")
            .field("view_mode", &self.view_mode())
            .field("selected_project", &self.selected_project())
            .field("search_query", &self.search_query())
            .finish()
    }
}

impl ViewStore {
    #[tracing::instrument(skip_all)]
    pub fn open(backend: Rc<dyn KvBackend>, clock: Rc<dyn Clock>, debounce: Duration) -> Self {
        let state = ViewState {
            view_mode: Persisted::load(
                Rc::clone(&backend),
                VIEW_MODE_KEY,
                ViewMode::default(),
                debounce,
            ),
            selected_project: Persisted::load(
                Rc::clone(&backend),
                SELECTED_PROJECT_KEY,
                None,
                debounce,
            ),
            search_query: Persisted::load(backend, SEARCH_QUERY_KEY, String::new(), debounce),
        };
        debug!(view = %state.view_mode.get(), "loaded view state");
        Self {
            state: Rc::new(RefCell::new(state)),
            clock,
        }
    }

    pub fn view_mode(&self) -> ViewMode {
        *self.state.borrow().view_mode.get()
    }

    pub fn selected_project(&self) -> Option<String> {
        self.state.borrow().selected_project.get().clone()
    }

    pub fn search_query(&self) -> String {
        self.state.borrow().search_query.get().clone()
    }

    pub fn set_view_mode(&self, mode: ViewMode) {
        let now = self.clock.now();
        self.state.borrow_mut().view_mode.set(mode, now);
    }

    pub fn set_selected_project(&self, project_id: Option<String>) {
        let now = self.clock.now();
        self.state.borrow_mut().selected_project.set(project_id, now);
    }

    pub fn set_search_query(&self, query: impl Into<String>) {
        let now = self.clock.now();
        self.state.borrow_mut().search_query.set(query.into(), now);
    }

    /// Switches to the project view for `project_id`.
    pub fn open_project(&self, project_id: impl Into<String>) {
        self.set_selected_project(Some(project_id.into()));
        self.set_view_mode(ViewMode::Project);
    }

    /// Drops the selection when it points at `project_id`.
    pub fn forget_project(&self, project_id: &str) -> bool {
        if self.selected_project().as_deref() != Some(project_id) {
            return false;
        }
        self.set_selected_project(None);
        true
    }

    pub fn apply_storage_event(&self, event: &StorageEvent) -> bool {
        let mut state = self.state.borrow_mut();
        state.view_mode.apply_remote(event)
            || state.selected_project.apply_remote(event)
            || state.search_query.apply_remote(event)
    }

    pub fn poll(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.borrow_mut();
        let view = state.view_mode.poll(now);
        let selected = state.selected_project.poll(now);
        let query = state.search_query.poll(now);
        view || selected || query
    }

    pub fn flush(&self) {
        let mut state = self.state.borrow_mut();
        state.view_mode.flush();
        state.selected_project.flush();
        state.search_query.flush();
    }

    pub fn write_due(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().earliest_write()
    }
}

/// Todos whose title, description or owning project's name contains
/// `query`, ignoring case, in collection order. A blank query matches
/// nothing.
pub fn search(todos: &[Todo], projects: &[Project], query: &str) -> Vec<Todo> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let project_names: HashMap<&str, String> = projects
        .iter()
        .map(|project| (project.id.as_str(), project.name.to_lowercase()))
        .collect();

    todos
        .iter()
        .filter(|todo| {
            todo.title.to_lowercase().contains(&needle)
                || todo
                    .description
                    .as_deref()
                    .is_some_and(|text| text.to_lowercase().contains(&needle))
                || project_names
                    .get(todo.project_id.as_str())
                    .is_some_and(|name| name.contains(&needle))
        })
        .cloned()
        .collect()
}
