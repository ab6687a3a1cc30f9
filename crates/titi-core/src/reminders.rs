use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::model::Todo;
use crate::todo_store::TodoStore;

pub const DEFAULT_CHECK_INTERVAL_SECS: i64 = 60;
pub const DEFAULT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    /// Not asked yet.
    Default,
    Granted,
    Denied,
    Unsupported,
}

impl NotificationPermission {
    pub fn as_label(self) -> &'static str {
        match self {
            NotificationPermission::Default => "default",
            NotificationPermission::Granted => "granted",
            NotificationPermission::Denied => "denied",
            NotificationPermission::Unsupported => "unsupported",
        }
    }
}

/// Platform notification side channel.
pub trait Notifier {
    fn permission(&self) -> NotificationPermission;

    /// Asks the user; returns the resulting permission.
    fn request_permission(&self) -> NotificationPermission;

    fn notify(&self, title: &str, body: &str) -> anyhow::Result<()>;
}

/// Notifier for terminal sessions: logs the reminder and prints it to
/// stderr.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    permission: NotificationPermission,
}

impl LogNotifier {
    pub fn new(enabled: bool) -> Self {
        let permission = if enabled {
            NotificationPermission::Granted
        } else {
            NotificationPermission::Denied
        };
        Self { permission }
    }
}

impl Notifier for LogNotifier {
    fn permission(&self) -> NotificationPermission {
        self.permission
    }

    fn request_permission(&self) -> NotificationPermission {
        self.permission
    }

    fn notify(&self, title: &str, body: &str) -> anyhow::Result<()> {
        info!(title, body, "reminder notification");
        let mut err = io::stderr().lock();
        writeln!(err, "[{title}] {body}")?;
        Ok(())
    }
}

/// Incomplete todos whose reminder lies in `(now - window, now)`.
pub fn due_reminders(todos: &[Todo], now: DateTime<Utc>, window: Duration) -> Vec<&Todo> {
    let oldest = now
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    todos
        .iter()
        .filter(|todo| !todo.completed)
        .filter(|todo| {
            todo.reminder
                .is_some_and(|at| at < now && at > oldest)
        })
        .collect()
}

/// Periodic reminder check. Each due reminder fires once and is then
/// cleared from its todo.
pub struct ReminderScheduler {
    notifier: Rc<dyn Notifier>,
    app_name: String,
    interval: Duration,
    window: Duration,
    next_check: Option<DateTime<Utc>>,
    permission_requested: bool,
}

impl fmt::Debug for ReminderScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReminderScheduler")
            .field("app_name", &self.app_name)
            .field("interval", &self.interval)
            .field("window", &self.window)
            .field("next_check", &self.next_check)
            .finish()
    }
}

impl ReminderScheduler {
    pub fn new(
        notifier: Rc<dyn Notifier>,
        app_name: impl Into<String>,
        interval: Duration,
        window: Duration,
    ) -> Self {
        Self {
            notifier,
            app_name: app_name.into(),
            interval,
            window,
            next_check: None,
            permission_requested: false,
        }
    }

    pub fn notification_title(&self) -> String {
        format!("{} Reminder", self.app_name)
    }

    /// Asks for notification permission the first time only, and only
    /// when the user has not decided yet.
    pub fn mount(&mut self) -> NotificationPermission {
        let current = self.notifier.permission();
        if self.permission_requested || current != NotificationPermission::Default {
            return current;
        }
        self.permission_requested = true;
        let decided = self.notifier.request_permission();
        info!(permission = decided.as_label(), "notification permission requested");
        decided
    }

    pub fn next_check(&self) -> Option<DateTime<Utc>> {
        self.next_check
    }

    /// Runs a check when one is due; the first call always checks.
    pub fn poll(&mut self, todos: &TodoStore, now: DateTime<Utc>) -> usize {
        if self.next_check.is_some_and(|at| now < at) {
            return 0;
        }
        self.next_check = Some(
            now.checked_add_signed(self.interval)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        self.check(todos, now)
    }

    /// Fires every due reminder and returns how many fired. Does nothing
    /// unless permission was granted.
    #[tracing::instrument(skip(self, todos))]
    pub fn check(&mut self, todos: &TodoStore, now: DateTime<Utc>) -> usize {
        let permission = self.notifier.permission();
        if permission != NotificationPermission::Granted {
            debug!(permission = permission.as_label(), "skipping reminders without permission");
            return 0;
        }

        let snapshot = todos.todos();
        let due: Vec<(String, String)> = due_reminders(&snapshot, now, self.window)
            .into_iter()
            .map(|todo| (todo.id.clone(), todo.title.clone()))
            .collect();

        let title = self.notification_title();
        for (id, body) in &due {
            if let Err(err) = self.notifier.notify(&title, body) {
                error!(id = %id, error = %err, "failed to emit reminder notification");
            }
            if !todos.clear_reminder(id) {
                warn!(id = %id, "todo vanished before its reminder was cleared");
            }
        }

        if !due.is_empty() {
            info!(fired = due.len(), "fired reminders");
        }
        due.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{NotificationPermission, Notifier, ReminderScheduler};
    use crate::datetime::{Clock, ManualClock};
    use crate::model::NewTodo;
    use crate::project_store::ProjectStore;
    use crate::storage::MemoryStorage;
    use crate::todo_store::TodoStore;

    struct Recorder {
        permission: Cell<NotificationPermission>,
        answer: NotificationPermission,
        requests: Cell<u32>,
        sent: RefCell<Vec<(String, String)>>,
    }

    impl Recorder {
        fn new(permission: NotificationPermission, answer: NotificationPermission) -> Rc<Self> {
            Rc::new(Self {
                permission: Cell::new(permission),
                answer,
                requests: Cell::new(0),
                sent: RefCell::new(Vec::new()),
            })
        }
    }

    impl Notifier for Recorder {
        fn permission(&self) -> NotificationPermission {
            self.permission.get()
        }

        fn request_permission(&self) -> NotificationPermission {
            self.requests.set(self.requests.get() + 1);
            self.permission.set(self.answer);
            self.answer
        }

        fn notify(&self, title: &str, body: &str) -> anyhow::Result<()> {
            self.sent
                .borrow_mut()
                .push((title.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0)
            .single()
            .expect("valid time")
    }

    fn todo_store(clock: Rc<ManualClock>) -> TodoStore {
        let storage = Rc::new(MemoryStorage::new());
        let debounce = Duration::milliseconds(300);
        let projects = ProjectStore::open(storage.clone(), clock.clone(), debounce);
        TodoStore::open(storage, clock, debounce, &projects)
    }

    fn scheduler(notifier: Rc<Recorder>) -> ReminderScheduler {
        ReminderScheduler::new(notifier, "TiTi", Duration::seconds(60), Duration::hours(24))
    }

    #[test]
    fn fires_due_reminders_once_and_clears_them() {
        let clock = Rc::new(ManualClock::utc(now()));
        let todos = todo_store(clock.clone());
        let due = todos.add(NewTodo::new("Call mom").remind_at(now() - Duration::minutes(5)));
        let stale = todos.add(NewTodo::new("Old").remind_at(now() - Duration::hours(25)));
        let future = todos.add(NewTodo::new("Later").remind_at(now() + Duration::minutes(5)));
        let done = todos.add(NewTodo::new("Done").remind_at(now() - Duration::minutes(1)));
        todos.toggle(&done.id);

        let recorder = Recorder::new(
            NotificationPermission::Granted,
            NotificationPermission::Granted,
        );
        let mut scheduler = scheduler(recorder.clone());

        assert_eq!(scheduler.poll(&todos, clock.now()), 1);
        assert_eq!(
            *recorder.sent.borrow(),
            vec![("TiTi Reminder".to_string(), "Call mom".to_string())]
        );
        assert_eq!(todos.get(&due.id).and_then(|t| t.reminder), None);
        assert!(todos.get(&stale.id).and_then(|t| t.reminder).is_some());
        assert!(todos.get(&future.id).and_then(|t| t.reminder).is_some());

        assert_eq!(scheduler.check(&todos, clock.now()), 0);
        assert_eq!(recorder.sent.borrow().len(), 1);
    }

    #[test]
    fn polling_respects_the_interval() {
        let clock = Rc::new(ManualClock::utc(now()));
        let todos = todo_store(clock.clone());
        let recorder = Recorder::new(
            NotificationPermission::Granted,
            NotificationPermission::Granted,
        );
        let mut scheduler = scheduler(recorder.clone());

        scheduler.poll(&todos, clock.now());
        todos.add(NewTodo::new("Soon").remind_at(now() + Duration::seconds(30)));

        clock.advance(Duration::seconds(45));
        assert_eq!(scheduler.poll(&todos, clock.now()), 0);
        clock.advance(Duration::seconds(15));
        assert_eq!(scheduler.poll(&todos, clock.now()), 1);
    }

    #[test]
    fn unbounded_interval_and_window_saturate() {
        let clock = Rc::new(ManualClock::utc(now()));
        let todos = todo_store(clock.clone());
        todos.add(NewTodo::new("Ancient").remind_at(now() - Duration::days(3650)));
        let recorder = Recorder::new(
            NotificationPermission::Granted,
            NotificationPermission::Granted,
        );
        let mut scheduler =
            ReminderScheduler::new(recorder.clone(), "TiTi", Duration::MAX, Duration::MAX);

        assert_eq!(scheduler.poll(&todos, clock.now()), 1);
        assert_eq!(scheduler.next_check(), Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(scheduler.poll(&todos, clock.now()), 0);
    }

    #[test]
    fn denied_permission_fires_and_clears_nothing() {
        let clock = Rc::new(ManualClock::utc(now()));
        let todos = todo_store(clock.clone());
        let todo = todos.add(NewTodo::new("Call mom").remind_at(now() - Duration::minutes(5)));
        let recorder = Recorder::new(
            NotificationPermission::Default,
            NotificationPermission::Denied,
        );
        let mut scheduler = scheduler(recorder.clone());

        assert_eq!(scheduler.mount(), NotificationPermission::Denied);
        assert_eq!(scheduler.poll(&todos, clock.now()), 0);
        assert!(recorder.sent.borrow().is_empty());
        assert!(todos.get(&todo.id).and_then(|t| t.reminder).is_some());
    }

    #[test]
    fn permission_is_requested_at_most_once() {
        let recorder = Recorder::new(
            NotificationPermission::Default,
            NotificationPermission::Default,
        );
        let mut scheduler = scheduler(recorder.clone());
        scheduler.mount();
        scheduler.mount();
        assert_eq!(recorder.requests.get(), 1);

        let decided = Recorder::new(
            NotificationPermission::Denied,
            NotificationPermission::Granted,
        );
        let mut scheduler = super::ReminderScheduler::new(
            decided.clone(),
            "TiTi",
            Duration::seconds(60),
            Duration::hours(24),
        );
        assert_eq!(scheduler.mount(), NotificationPermission::Denied);
        assert_eq!(decided.requests.get(), 0);
    }
}
