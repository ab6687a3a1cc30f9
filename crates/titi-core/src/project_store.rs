use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::datetime::Clock;
use crate::events::{Channel, Subscription};
use crate::model::{INBOX_PROJECT_ID, NewProject, Project, ProjectPatch, new_id};
use crate::storage::{KvBackend, PROJECTS_KEY, Persisted, StorageEvent};

/// Published after a project record has been removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDeleted {
    pub id: String,
}

struct ProjectState {
    projects: Persisted<Rc<Vec<Project>>>,
    revision: u64,
}

/// Handle to the project hierarchy. Clones share the same state.
#[derive(Clone)]
pub struct ProjectStore {
    state: Rc<RefCell<ProjectState>>,
    deleted: Channel<ProjectDeleted>,
    clock: Rc<dyn Clock>,
}

impl fmt::Debug for ProjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ProjectStore")
            .field("projects", &state.projects.get().len())
            .field("revision", &state.revision)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl ProjectStore {
    #[tracing::instrument(skip_all)]
    pub fn open(backend: Rc<dyn KvBackend>, clock: Rc<dyn Clock>, debounce: Duration) -> Self {
        let now = clock.now();
        let mut projects = Persisted::load(
            backend,
            PROJECTS_KEY,
            Rc::new(vec![Project::inbox(now)]),
            debounce,
        );
        if !has_inbox(projects.get()) {
            warn!("stored projects lack the inbox; restoring it");
            projects.update(now, |list| {
                Rc::make_mut(list).insert(0, Project::inbox(now));
            });
        }
        info!(count = projects.get().len(), "loaded projects");

        Self {
            state: Rc::new(RefCell::new(ProjectState {
                projects,
                revision: 0,
            })),
            deleted: Channel::new(),
            clock,
        }
    }

    /// Current read snapshot. The pointer changes whenever the collection
    /// does.
    pub fn projects(&self) -> Rc<Vec<Project>> {
        Rc::clone(self.state.borrow().projects.get())
    }

    pub fn revision(&self) -> u64 {
        self.state.borrow().revision
    }

    pub fn get(&self, id: &str) -> Option<Project> {
        self.state
            .borrow()
            .projects
            .get()
            .iter()
            .find(|project| project.id == id)
            .cloned()
    }

    pub fn name_of(&self, id: &str) -> Option<String> {
        self.get(id).map(|project| project.name)
    }

    #[tracing::instrument(skip(self, new), fields(name = %new.name))]
    pub fn add(&self, new: NewProject) -> Project {
        let now = self.clock.now();
        let order = self.state.borrow().projects.get().len();
        let project = Project {
            id: new_id(),
            name: new.name,
            color: new.color,
            parent_id: new.parent_id,
            created_at: now,
            order,
        };
        let created = project.clone();
        self.mutate(|projects| projects.push(project));
        debug!(id = %created.id, order, "project added");
        created
    }

    #[tracing::instrument(skip(self, patch))]
    pub fn update(&self, id: &str, patch: ProjectPatch) -> bool {
        let Some(idx) = self.position(id) else {
            debug!("update of unknown project ignored");
            return false;
        };
        self.mutate(|projects| patch.apply(&mut projects[idx]));
        true
    }

    /// Removes the project and tells every deletion listener about it.
    /// The inbox is never removed. Subprojects keep their `parentId`.
    #[tracing::instrument(skip(self))]
    pub fn delete(&self, id: &str) -> bool {
        if id == INBOX_PROJECT_ID {
            warn!("refusing to delete the inbox project");
            return false;
        }

        let removed = match self.position(id) {
            Some(idx) => {
                self.mutate(|projects| {
                    projects.remove(idx);
                });
                true
            }
            None => false,
        };

        let notified = self.deleted.publish(&ProjectDeleted { id: id.to_string() });
        info!(removed, notified, "project deleted");
        removed
    }

    /// Registers a listener for project deletions.
    pub fn subscribe_deleted(&self, listener: impl Fn(&ProjectDeleted) + 'static) -> Subscription {
        self.deleted.subscribe(listener)
    }

    pub fn deletion_listener_count(&self) -> usize {
        self.deleted.listener_count()
    }

    /// Direct children of `parent_id`, in stored order.
    pub fn subprojects(&self, parent_id: &str) -> Vec<Project> {
        self.state
            .borrow()
            .projects
            .get()
            .iter()
            .filter(|project| project.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    pub fn root_projects(&self) -> Vec<Project> {
        self.state
            .borrow()
            .projects
            .get()
            .iter()
            .filter(|project| project.parent_id.is_none())
            .cloned()
            .collect()
    }

    #[tracing::instrument(skip(self, projects), fields(count = projects.len()))]
    pub fn replace_all(&self, mut projects: Vec<Project>) {
        if !has_inbox(&projects) {
            projects.insert(0, Project::inbox(self.clock.now()));
        }
        self.mutate(|current| *current = projects);
    }

    pub fn apply_storage_event(&self, event: &StorageEvent) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.projects.apply_remote(event) {
            return false;
        }
        if !has_inbox(state.projects.get()) {
            warn!("projects from another context lack the inbox; restoring it");
            let now = self.clock.now();
            state.projects.update(now, |list| {
                Rc::make_mut(list).insert(0, Project::inbox(now));
            });
        }
        state.revision += 1;
        debug!(count = state.projects.get().len(), "projects replaced from another context");
        true
    }

    pub fn poll(&self, now: DateTime<Utc>) -> bool {
        self.state.borrow_mut().projects.poll(now)
    }

    pub fn flush(&self) {
        self.state.borrow_mut().projects.flush();
    }

    pub fn write_due(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().projects.write_due()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.state
            .borrow()
            .projects
            .get()
            .iter()
            .position(|project| project.id == id)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Project>) -> R) -> R {
        let now = self.clock.now();
        let mut state = self.state.borrow_mut();
        let out = state.projects.update(now, |projects| f(Rc::make_mut(projects)));
        state.revision += 1;
        out
    }
}

fn has_inbox(projects: &[Project]) -> bool {
    projects.iter().any(Project::is_inbox)
}
