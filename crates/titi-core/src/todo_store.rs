use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::datetime::{Clock, checked_add_days};
use crate::events::Subscription;
use crate::model::{NewTodo, Priority, Todo, TodoPatch, new_id};
use crate::project_store::ProjectStore;
use crate::storage::{KvBackend, Persisted, StorageEvent, TODOS_KEY};

/// Derived lists over top-level, incomplete todos.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmartLists {
    /// Due strictly before today.
    pub overdue: Vec<Todo>,
    pub no_date: Vec<Todo>,
    pub high_priority: Vec<Todo>,
}

impl SmartLists {
    pub fn compute(todos: &[Todo], today: NaiveDate) -> Self {
        let mut lists = Self::default();
        for todo in todos.iter().filter(|todo| todo.is_top_level_incomplete()) {
            match todo.due_date {
                Some(due) if due < today => lists.overdue.push(todo.clone()),
                Some(_) => {}
                None => lists.no_date.push(todo.clone()),
            }
            if todo.priority == Priority::High {
                lists.high_priority.push(todo.clone());
            }
        }
        lists
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToggleOutcome {
    /// The todo is now complete; `spawned` is the next occurrence of a
    /// recurring todo.
    Completed { spawned: Option<Todo> },
    Reopened,
}

struct SmartCache {
    revision: u64,
    today: NaiveDate,
    lists: Rc<SmartLists>,
}

struct TodoState {
    todos: Persisted<Rc<Vec<Todo>>>,
    revision: u64,
    smart: Option<SmartCache>,
    project_deletions: Option<Subscription>,
}

/// Handle to the flat todo collection. Clones share the same state.
#[derive(Clone)]
pub struct TodoStore {
    state: Rc<RefCell<TodoState>>,
    clock: Rc<dyn Clock>,
}

impl fmt::Debug for TodoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TodoStore")
            .field("todos", &state.todos.get().len())
            .field("revision", &state.revision)
            .finish()
    }
}

impl TodoStore {
    /// Loads the todos and subscribes to `projects` so that deleting a
    /// project removes its todos. The subscription ends when the last
    /// handle is dropped.
    #[tracing::instrument(skip_all)]
    pub fn open(
        backend: Rc<dyn KvBackend>,
        clock: Rc<dyn Clock>,
        debounce: Duration,
        projects: &ProjectStore,
    ) -> Self {
        let todos = Persisted::load(backend, TODOS_KEY, Rc::new(Vec::new()), debounce);
        info!(count = todos.get().len(), "loaded todos");

        let store = Self {
            state: Rc::new(RefCell::new(TodoState {
                todos,
                revision: 0,
                smart: None,
                project_deletions: None,
            })),
            clock,
        };

        let weak = Rc::downgrade(&store.state);
        let clock = Rc::clone(&store.clock);
        let subscription = projects.subscribe_deleted(move |event| {
            if let Some(state) = weak.upgrade() {
                let store = TodoStore {
                    state,
                    clock: Rc::clone(&clock),
                };
                store.delete_by_project(&event.id);
            }
        });
        store.state.borrow_mut().project_deletions = Some(subscription);

        store
    }

    /// Current read snapshot. The pointer changes whenever the collection
    /// does.
    pub fn todos(&self) -> Rc<Vec<Todo>> {
        Rc::clone(self.state.borrow().todos.get())
    }

    pub fn revision(&self) -> u64 {
        self.state.borrow().revision
    }

    pub fn get(&self, id: &str) -> Option<Todo> {
        self.state
            .borrow()
            .todos
            .get()
            .iter()
            .find(|todo| todo.id == id)
            .cloned()
    }

    /// Appends a todo. The title is stored as given.
    #[tracing::instrument(skip(self, new), fields(project = %new.project_id))]
    pub fn add(&self, new: NewTodo) -> Todo {
        let todo = Todo::from_new(new, new_id(), self.clock.now());
        let created = todo.clone();
        self.mutate(|todos| todos.push(todo));
        debug!(id = %created.id, "todo added");
        created
    }

    #[tracing::instrument(skip(self, patch))]
    pub fn update(&self, id: &str, patch: TodoPatch) -> Option<Todo> {
        let Some(idx) = self.position(id) else {
            debug!("update of unknown todo ignored");
            return None;
        };
        let updated = self.mutate(|todos| {
            patch.apply(&mut todos[idx]);
            todos[idx].clone()
        });
        Some(updated)
    }

    /// Removes the todo and its direct subtasks. Returns how many todos
    /// were removed.
    #[tracing::instrument(skip(self))]
    pub fn delete(&self, id: &str) -> usize {
        let doomed = |todo: &Todo| todo.id == id || todo.parent_id.as_deref() == Some(id);
        self.remove_where(doomed)
    }

    #[tracing::instrument(skip(self))]
    pub fn toggle(&self, id: &str) -> Option<ToggleOutcome> {
        let idx = self.position(id)?;
        let now = self.clock.now();

        let outcome = self.mutate(|todos| {
            let todo = &mut todos[idx];
            if todo.completed {
                todo.completed = false;
                todo.completed_at = None;
                return ToggleOutcome::Reopened;
            }

            todo.completed = true;
            todo.completed_at = Some(now);

            let spawned = match todo.due_date {
                Some(due) if todo.recurrence.is_recurring() => {
                    let mut next = todo.clone();
                    next.id = new_id();
                    next.completed = false;
                    next.completed_at = None;
                    next.created_at = now;
                    next.due_date = Some(todo.recurrence.advance(due));
                    Some(next)
                }
                _ => None,
            };
            if let Some(next) = &spawned {
                todos.push(next.clone());
            }
            ToggleOutcome::Completed { spawned }
        });

        debug!(?outcome, "todo toggled");
        Some(outcome)
    }

    /// Pushes the due date `days` out (from today when undated). A parent
    /// whose due date is missing or earlier than the new date is moved to
    /// match. `None` for an unknown id or a date past the calendar range.
    #[tracing::instrument(skip(self))]
    pub fn extend(&self, id: &str, days: i64) -> Option<NaiveDate> {
        let idx = self.position(id)?;
        let base = self.state.borrow().todos.get()[idx]
            .due_date
            .unwrap_or_else(|| self.clock.today());
        let Some(new_due) = checked_add_days(base, days) else {
            warn!(%base, days, "extension leaves the calendar range; ignored");
            return None;
        };

        self.mutate(|todos| {
            todos[idx].due_date = Some(new_due);

            if let Some(parent_id) = todos[idx].parent_id.clone()
                && let Some(parent) = todos.iter_mut().find(|todo| todo.id == parent_id)
                && parent.due_date.is_none_or(|due| due < new_due)
            {
                debug!(parent = %parent.id, %new_due, "raised parent due date");
                parent.due_date = Some(new_due);
            }
        });
        Some(new_due)
    }

    pub fn subtasks(&self, parent_id: &str) -> Vec<Todo> {
        self.filtered(|todo| todo.parent_id.as_deref() == Some(parent_id))
    }

    pub fn project_todos(&self, project_id: &str) -> Vec<Todo> {
        self.filtered(|todo| todo.project_id == project_id)
    }

    #[tracing::instrument(skip(self))]
    pub fn delete_by_project(&self, project_id: &str) -> usize {
        let removed = self.remove_where(|todo| todo.project_id == project_id);
        info!(removed, "removed todos of deleted project");
        removed
    }

    pub fn clear_reminder(&self, id: &str) -> bool {
        self.update(
            id,
            TodoPatch {
                reminder: Some(None),
                ..TodoPatch::default()
            },
        )
        .is_some()
    }

    #[tracing::instrument(skip(self, todos), fields(count = todos.len()))]
    pub fn replace_all(&self, todos: Vec<Todo>) {
        self.mutate(|current| *current = todos);
    }

    /// Smart lists for the clock's current day, recomputed only when the
    /// collection or the day changed.
    pub fn smart_lists(&self) -> Rc<SmartLists> {
        let today = self.clock.today();
        let mut state = self.state.borrow_mut();
        if let Some(cache) = &state.smart
            && cache.revision == state.revision
            && cache.today == today
        {
            return Rc::clone(&cache.lists);
        }

        let lists = Rc::new(SmartLists::compute(state.todos.get(), today));
        state.smart = Some(SmartCache {
            revision: state.revision,
            today,
            lists: Rc::clone(&lists),
        });
        lists
    }

    pub fn overdue(&self) -> Vec<Todo> {
        self.smart_lists().overdue.clone()
    }

    pub fn no_date(&self) -> Vec<Todo> {
        self.smart_lists().no_date.clone()
    }

    pub fn high_priority(&self) -> Vec<Todo> {
        self.smart_lists().high_priority.clone()
    }

    pub fn apply_storage_event(&self, event: &StorageEvent) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.todos.apply_remote(event) {
            return false;
        }
        state.revision += 1;
        debug!(count = state.todos.get().len(), "todos replaced from another context");
        true
    }

    pub fn poll(&self, now: DateTime<Utc>) -> bool {
        self.state.borrow_mut().todos.poll(now)
    }

    pub fn flush(&self) {
        self.state.borrow_mut().todos.flush();
    }

    pub fn write_due(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().todos.write_due()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.state
            .borrow()
            .todos
            .get()
            .iter()
            .position(|todo| todo.id == id)
    }

    fn filtered(&self, keep: impl Fn(&Todo) -> bool) -> Vec<Todo> {
        self.state
            .borrow()
            .todos
            .get()
            .iter()
            .filter(|todo| keep(todo))
            .cloned()
            .collect()
    }

    fn remove_where(&self, doomed: impl Fn(&Todo) -> bool) -> usize {
        let count = self
            .state
            .borrow()
            .todos
            .get()
            .iter()
            .filter(|todo| doomed(todo))
            .count();
        if count == 0 {
            return 0;
        }
        self.mutate(|todos| todos.retain(|todo| !doomed(todo)));
        count
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Todo>) -> R) -> R {
        let now = self.clock.now();
        let mut state = self.state.borrow_mut();
        let out = state.todos.update(now, |todos| f(Rc::make_mut(todos)));
        state.revision += 1;
        out
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    use super::{ToggleOutcome, TodoStore};
    use crate::datetime::{Clock, ManualClock};
    use crate::model::{NewProject, NewTodo, Priority, Recurrence, Todo, TodoPatch};
    use crate::project_store::ProjectStore;
    use crate::storage::MemoryStorage;

    struct Fixture {
        clock: Rc<ManualClock>,
        projects: ProjectStore,
        todos: TodoStore,
    }

    fn fixture() -> Fixture {
        let clock = Rc::new(ManualClock::utc(
            Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0)
                .single()
                .expect("valid time"),
        ));
        let storage = Rc::new(MemoryStorage::new());
        let debounce = Duration::milliseconds(300);
        let projects = ProjectStore::open(storage.clone(), clock.clone(), debounce);
        let todos = TodoStore::open(storage, clock.clone(), debounce, &projects);
        Fixture {
            clock,
            projects,
            todos,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn toggling_twice_restores_completion_state() {
        let f = fixture();
        let todo = f.todos.add(NewTodo::new("Write report"));

        assert_eq!(
            f.todos.toggle(&todo.id),
            Some(ToggleOutcome::Completed { spawned: None })
        );
        let done = f.todos.get(&todo.id).expect("present");
        assert!(done.completed);
        assert_eq!(done.completed_at, Some(f.clock.now()));

        assert_eq!(f.todos.toggle(&todo.id), Some(ToggleOutcome::Reopened));
        let back = f.todos.get(&todo.id).expect("present");
        assert_eq!(back, todo);
        assert_eq!(f.todos.todos().len(), 1);
    }

    #[test]
    fn completing_recurring_todo_spawns_next_from_due_date() {
        let f = fixture();
        let cases = [
            (Recurrence::Daily, date(2026, 1, 31), date(2026, 2, 1)),
            (Recurrence::Weekly, date(2026, 1, 31), date(2026, 2, 7)),
            (Recurrence::Monthly, date(2026, 1, 31), date(2026, 2, 28)),
        ];

        for (recurrence, due, expected) in cases {
            let original = f.todos.add(
                NewTodo::new("Water plants")
                    .due(due)
                    .recurring(recurrence)
                    .with_priority(Priority::High),
            );
            let before = f.todos.todos().len();

            let Some(ToggleOutcome::Completed { spawned: Some(next) }) =
                f.todos.toggle(&original.id)
            else {
                panic!("expected a spawned occurrence for {recurrence:?}");
            };

            assert_eq!(f.todos.todos().len(), before + 1);
            assert_eq!(next.due_date, Some(expected));
            assert!(!next.completed);
            assert_eq!(next.completed_at, None);
            assert_ne!(next.id, original.id);
            assert_eq!(next.title, original.title);
            assert_eq!(next.priority, Priority::High);
            assert_eq!(next.recurrence, recurrence);

            let completed = f.todos.get(&original.id).expect("original kept");
            assert!(completed.completed);
            assert_eq!(completed.due_date, Some(due));
        }
    }

    #[test]
    fn recurring_todo_without_due_date_just_completes() {
        let f = fixture();
        let todo = f.todos.add(NewTodo::new("Stretch").recurring(Recurrence::Daily));
        assert_eq!(
            f.todos.toggle(&todo.id),
            Some(ToggleOutcome::Completed { spawned: None })
        );
        assert_eq!(f.todos.todos().len(), 1);
    }

    #[test]
    fn reopening_recurring_todo_does_not_spawn() {
        let f = fixture();
        let todo = f.todos.add(
            NewTodo::new("Standup")
                .due(date(2026, 10, 18))
                .recurring(Recurrence::Daily),
        );
        f.todos.toggle(&todo.id);
        assert_eq!(f.todos.todos().len(), 2);
        assert_eq!(f.todos.toggle(&todo.id), Some(ToggleOutcome::Reopened));
        assert_eq!(f.todos.todos().len(), 2);
    }

    #[test]
    fn extending_subtask_raises_parent_but_never_lowers_it() {
        let f = fixture();
        let parent = f.todos.add(NewTodo::new("Launch").due(date(2026, 10, 25)));
        let child = f.todos.add(
            NewTodo::new("Docs")
                .due(date(2026, 10, 20))
                .subtask_of(parent.id.clone()),
        );

        assert_eq!(f.todos.extend(&child.id, 3), Some(date(2026, 10, 23)));
        assert_eq!(
            f.todos.get(&parent.id).and_then(|t| t.due_date),
            Some(date(2026, 10, 25))
        );

        assert_eq!(f.todos.extend(&child.id, 7), Some(date(2026, 10, 30)));
        assert_eq!(
            f.todos.get(&parent.id).and_then(|t| t.due_date),
            Some(date(2026, 10, 30))
        );
    }

    #[test]
    fn extending_undated_todo_counts_from_today() {
        let f = fixture();
        let parent = f.todos.add(NewTodo::new("Move house"));
        let child = f.todos.add(NewTodo::new("Boxes").subtask_of(parent.id.clone()));

        assert_eq!(f.todos.extend(&child.id, 2), Some(date(2026, 10, 20)));
        assert_eq!(
            f.todos.get(&parent.id).and_then(|t| t.due_date),
            Some(date(2026, 10, 20))
        );
        assert_eq!(f.todos.extend("missing", 2), None);
    }

    #[test]
    fn extension_propagates_one_level_only() {
        let f = fixture();
        let top = f.todos.add(NewTodo::new("top").due(date(2026, 10, 19)));
        let mid = f.todos.add(
            NewTodo::new("mid")
                .due(date(2026, 10, 19))
                .subtask_of(top.id.clone()),
        );
        let leaf = f.todos.add(
            NewTodo::new("leaf")
                .due(date(2026, 10, 19))
                .subtask_of(mid.id.clone()),
        );

        f.todos.extend(&leaf.id, 10);
        assert_eq!(f.todos.get(&mid.id).and_then(|t| t.due_date), Some(date(2026, 10, 29)));
        assert_eq!(f.todos.get(&top.id).and_then(|t| t.due_date), Some(date(2026, 10, 19)));
    }

    #[test]
    fn extension_past_the_calendar_is_ignored() {
        let f = fixture();
        let parent = f.todos.add(NewTodo::new("Launch").due(date(2026, 10, 25)));
        let child = f.todos.add(
            NewTodo::new("Docs")
                .due(date(2026, 10, 20))
                .subtask_of(parent.id.clone()),
        );
        let before = f.todos.todos();
        let revision = f.todos.revision();

        assert_eq!(f.todos.extend(&child.id, i64::MAX), None);
        assert_eq!(f.todos.extend(&child.id, i64::MIN), None);
        assert!(Rc::ptr_eq(&before, &f.todos.todos()));
        assert_eq!(f.todos.revision(), revision);
        assert_eq!(
            f.todos.get(&child.id).and_then(|t| t.due_date),
            Some(date(2026, 10, 20))
        );
    }

    #[test]
    fn project_todos_include_subtasks_in_collection_order() {
        let f = fixture();
        let work = f.projects.add(NewProject::new("Work", "#34C759"));
        let report = f.todos.add(NewTodo::new("Report").in_project(work.id.clone()));
        f.todos.add(NewTodo::new("Groceries"));
        let draft = f.todos.add(
            NewTodo::new("Draft")
                .in_project(work.id.clone())
                .subtask_of(report.id.clone()),
        );
        let review = f.todos.add(NewTodo::new("Review").in_project(work.id.clone()));

        let ids: Vec<String> = f
            .todos
            .project_todos(&work.id)
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![report.id, draft.id, review.id]);
        assert!(f.todos.project_todos("missing").is_empty());
    }

    #[test]
    fn delete_removes_direct_subtasks_only() {
        let f = fixture();
        let parent = f.todos.add(NewTodo::new("parent"));
        let child = f.todos.add(NewTodo::new("child").subtask_of(parent.id.clone()));
        let grandchild = f.todos.add(NewTodo::new("grandchild").subtask_of(child.id.clone()));
        let other = f.todos.add(NewTodo::new("other"));

        assert_eq!(f.todos.delete(&parent.id), 2);
        let remaining: Vec<String> = f.todos.todos().iter().map(|t| t.id.clone()).collect();
        assert_eq!(remaining, vec![grandchild.id, other.id]);
        assert_eq!(f.todos.delete("missing"), 0);
    }

    #[test]
    fn project_deletion_cascades_through_subscription() {
        let f = fixture();
        let work = f.projects.add(NewProject::new("Work", "#34C759"));
        let home = f.projects.add(NewProject::new("Home", "#FF9500"));
        f.todos.add(NewTodo::new("a").in_project(work.id.clone()));
        f.todos.add(NewTodo::new("b").in_project(work.id.clone()));
        let kept = f.todos.add(NewTodo::new("c").in_project(home.id.clone()));

        assert_eq!(f.projects.deletion_listener_count(), 1);
        f.projects.delete(&work.id);

        let remaining = f.todos.todos();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.id);
    }

    #[test]
    fn dropping_the_store_unsubscribes_from_projects() {
        let f = fixture();
        assert_eq!(f.projects.deletion_listener_count(), 1);
        let projects = f.projects.clone();
        drop(f);
        assert_eq!(projects.deletion_listener_count(), 0);
    }

    #[test]
    fn smart_lists_skip_subtasks_and_completed() {
        let f = fixture();
        let yesterday = date(2026, 10, 17);
        let rent = f.todos.add(
            NewTodo::new("Pay rent")
                .due(yesterday)
                .with_priority(Priority::High),
        );
        let parent = f.todos.add(NewTodo::new("Plan trip"));
        f.todos.add(
            NewTodo::new("Book hotel")
                .due(yesterday)
                .with_priority(Priority::High)
                .subtask_of(parent.id.clone()),
        );
        f.todos.add(NewTodo::new("Due today").due(date(2026, 10, 18)));

        fn titles(todos: &[Todo]) -> Vec<String> {
            todos.iter().map(|t| t.title.clone()).collect()
        }

        let lists = f.todos.smart_lists();
        assert_eq!(titles(&lists.overdue), vec!["Pay rent".to_string()]);
        assert_eq!(titles(&lists.high_priority), vec!["Pay rent".to_string()]);
        assert_eq!(titles(&lists.no_date), vec!["Plan trip".to_string()]);

        f.todos.toggle(&rent.id);
        let lists = f.todos.smart_lists();
        assert!(lists.overdue.is_empty());
        assert!(lists.high_priority.is_empty());
    }

    #[test]
    fn smart_lists_are_memoized_until_todos_or_day_change() {
        let f = fixture();
        f.todos.add(NewTodo::new("Call bank").due(date(2026, 10, 18)));

        let first = f.todos.smart_lists();
        assert!(Rc::ptr_eq(&first, &f.todos.smart_lists()));
        assert!(first.overdue.is_empty());

        f.clock.advance(Duration::days(1));
        let next_day = f.todos.smart_lists();
        assert!(!Rc::ptr_eq(&first, &next_day));
        assert_eq!(next_day.overdue.len(), 1);

        f.todos.update(
            "missing",
            TodoPatch {
                title: Some("x".to_string()),
                ..TodoPatch::default()
            },
        );
        assert!(Rc::ptr_eq(&next_day, &f.todos.smart_lists()));
    }
}
