use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};

use crate::config::Settings;
use crate::datetime::Clock;
use crate::filter::{ListRequest, TimelineFilter, list_todos};
use crate::model::Todo;
use crate::project_store::ProjectStore;
use crate::reminders::{Notifier, ReminderScheduler};
use crate::storage::KvBackend;
use crate::todo_store::TodoStore;
use crate::transfer::{self, ImportError, ImportSummary};
use crate::view::{ViewStore, search};

/// What one [`Session::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub remote_events: usize,
    pub remote_applied: usize,
    pub writes: usize,
    pub reminders_fired: usize,
}

/// Every store of one execution context, wired together over one
/// storage backend.
pub struct Session {
    backend: Rc<dyn KvBackend>,
    clock: Rc<dyn Clock>,
    projects: ProjectStore,
    todos: TodoStore,
    view: ViewStore,
    reminders: ReminderScheduler,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("projects", &self.projects)
            .field("todos", &self.todos)
            .field("view", &self.view)
            .field("reminders", &self.reminders)
            .finish()
    }
}

impl Session {
    #[tracing::instrument(skip_all)]
    pub fn open(
        backend: Rc<dyn KvBackend>,
        clock: Rc<dyn Clock>,
        notifier: Rc<dyn Notifier>,
        settings: &Settings,
    ) -> Self {
        let projects = ProjectStore::open(Rc::clone(&backend), Rc::clone(&clock), settings.debounce);
        let todos = TodoStore::open(
            Rc::clone(&backend),
            Rc::clone(&clock),
            settings.debounce,
            &projects,
        );
        let view = ViewStore::open(Rc::clone(&backend), Rc::clone(&clock), settings.debounce);

        let mut reminders = ReminderScheduler::new(
            notifier,
            settings.app_name.clone(),
            settings.reminder_interval,
            settings.reminder_window,
        );
        let permission = reminders.mount();
        info!(permission = permission.as_label(), "session opened");

        Self {
            backend,
            clock,
            projects,
            todos,
            view,
            reminders,
        }
    }

    pub fn projects(&self) -> &ProjectStore {
        &self.projects
    }

    pub fn todos(&self) -> &TodoStore {
        &self.todos
    }

    pub fn view(&self) -> &ViewStore {
        &self.view
    }

    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    /// One event-loop turn: applies changes from other contexts, writes
    /// settled values, then checks reminders when due.
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for event in self.backend.drain_events() {
            report.remote_events += 1;
            let applied = self.projects.apply_storage_event(&event)
                || self.todos.apply_storage_event(&event)
                || self.view.apply_storage_event(&event);
            if applied {
                report.remote_applied += 1;
            } else {
                trace!(key = %event.key, "storage event not applied");
            }
        }

        report.writes = [
            self.projects.poll(now),
            self.todos.poll(now),
            self.view.poll(now),
        ]
        .into_iter()
        .filter(|wrote| *wrote)
        .count();

        report.reminders_fired = self.reminders.poll(&self.todos, now);

        if report != TickReport::default() {
            debug!(?report, "tick");
        }
        report
    }

    /// The next instant at which [`Session::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        [
            self.projects.write_due(),
            self.todos.write_due(),
            self.view.write_due(),
            self.reminders.next_check(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Deletes a project and clears the selection if it pointed there.
    pub fn delete_project(&self, id: &str) -> bool {
        let removed = self.projects.delete(id);
        if removed {
            self.view.forget_project(id);
        }
        removed
    }

    pub fn export(&self) -> anyhow::Result<String> {
        transfer::export_data(&self.todos.todos(), &self.projects.projects(), self.clock.now())
    }

    /// Validates `raw` and applies it. Nothing changes on error.
    pub fn import(&self, raw: &str) -> Result<ImportSummary, ImportError> {
        let data = transfer::import_data(raw, self.clock.now())?;
        Ok(transfer::apply_import(data, &self.todos, &self.projects))
    }

    /// The list for the persisted view state.
    pub fn visible_todos(&self, timeline: TimelineFilter, show_completed: bool) -> Vec<Todo> {
        let todos = self.todos.todos();
        let projects = self.projects.projects();
        let smart = self.todos.smart_lists();
        let selected = self.view.selected_project();
        let query = self.view.search_query();
        list_todos(&ListRequest {
            mode: self.view.view_mode(),
            todos: &todos,
            projects: &projects,
            smart: &smart,
            selected_project: selected.as_deref(),
            search_query: &query,
            timeline,
            show_completed,
            today: self.clock.today(),
        })
    }

    pub fn search_results(&self) -> Vec<Todo> {
        search(
            &self.todos.todos(),
            &self.projects.projects(),
            &self.view.search_query(),
        )
    }

    /// Writes everything still pending.
    pub fn flush(&self) {
        self.projects.flush();
        self.todos.flush();
        self.view.flush();
    }

    pub fn shutdown(self) {
        self.flush();
        info!("session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use chrono::{Duration, TimeZone, Utc};

    use super::Session;
    use crate::config::Settings;
    use crate::datetime::{Clock, ManualClock};
    use crate::model::{NewProject, NewTodo, ViewMode};
    use crate::reminders::LogNotifier;
    use crate::storage::{KvBackend, MemoryStorage, TODOS_KEY};

    fn open(storage: MemoryStorage, clock: Rc<ManualClock>) -> Session {
        Session::open(
            Rc::new(storage),
            clock,
            Rc::new(LogNotifier::new(false)),
            &Settings::default(),
        )
    }

    fn clock() -> Rc<ManualClock> {
        let start = Utc
            .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid time");
        Rc::new(ManualClock::utc(start))
    }

    #[test]
    fn tick_writes_after_debounce() {
        let storage = MemoryStorage::new();
        let probe = storage.context();
        let clock = clock();
        let mut session = open(storage, clock.clone());
        session.tick();

        session.todos().add(NewTodo::new("Pay rent"));
        let due = session.next_deadline().expect("pending write");
        assert_eq!(due, clock.now() + Duration::milliseconds(300));
        assert_eq!(session.tick().writes, 0);

        clock.advance(Duration::milliseconds(300));
        assert_eq!(session.tick().writes, 1);
        let stored = probe.get_item(TODOS_KEY).expect("read").expect("written");
        assert!(stored.contains("Pay rent"));
    }

    #[test]
    fn deleting_selected_project_clears_selection() {
        let clock = clock();
        let session = open(MemoryStorage::new(), clock);
        let work = session.projects().add(NewProject::new("Work", "#34C759"));
        session.view().open_project(work.id.clone());
        session.todos().add(NewTodo::new("Ship it").in_project(work.id.clone()));

        assert!(session.delete_project(&work.id));
        assert_eq!(session.view().selected_project(), None);
        assert!(session.todos().todos().is_empty());
    }

    #[test]
    fn visible_todos_follow_view_state() {
        let clock = clock();
        let session = open(MemoryStorage::new(), clock.clone());
        session.todos().add(NewTodo::new("Pay rent").due(clock.today()));
        session.todos().add(NewTodo::new("Someday"));

        assert_eq!(session.visible_todos(Default::default(), false).len(), 1);

        session.view().set_view_mode(ViewMode::Search);
        session.view().set_search_query("some");
        let found = session.visible_todos(Default::default(), false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Someday");
        assert_eq!(session.search_results(), found);
    }

    #[test]
    fn shutdown_flushes_pending_writes() {
        let storage = MemoryStorage::new();
        let probe = storage.context();
        let session = open(storage, clock());
        session.todos().add(NewTodo::new("Pay rent"));
        session.shutdown();
        assert!(probe.get_item(TODOS_KEY).expect("read").is_some());
    }
}
