use std::rc::Rc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use tempfile::tempdir;
use titi_core::cli::{Command, ProjectCommand};
use titi_core::commands::dispatch;
use titi_core::config::Settings;
use titi_core::datetime::{Clock, ManualClock};
use titi_core::model::{NewProject, NewTodo, Priority, Recurrence, ViewMode};
use titi_core::reminders::LogNotifier;
use titi_core::render::Renderer;
use titi_core::session::Session;
use titi_core::storage::{FileStorage, KvBackend, MemoryStorage};
use titi_core::todo_store::ToggleOutcome;
use titi_core::transfer::ImportError;
use titi_core::view::search;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
        .single()
        .expect("valid time")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn session(backend: Rc<dyn KvBackend>, clock: Rc<ManualClock>) -> Session {
    Session::open(
        backend,
        clock,
        Rc::new(LogNotifier::new(false)),
        &Settings::default(),
    )
}

#[test]
fn overdue_high_priority_todo_leaves_smart_lists_when_done() {
    let clock = Rc::new(ManualClock::utc(start()));
    let session = session(Rc::new(MemoryStorage::new()), clock.clone());
    let todos = session.todos();

    let rent = todos.add(
        NewTodo::new("Pay rent")
            .due(date(2026, 10, 17))
            .with_priority(Priority::High),
    );
    assert_eq!(todos.overdue(), vec![rent.clone()]);
    assert_eq!(todos.high_priority(), vec![rent.clone()]);
    assert!(todos.no_date().is_empty());

    todos.toggle(&rent.id);
    assert!(todos.overdue().is_empty());
    assert!(todos.high_priority().is_empty());
}

#[test]
fn monthly_recurrence_clamps_to_month_end() {
    let clock = Rc::new(ManualClock::utc(start()));
    let session = session(Rc::new(MemoryStorage::new()), clock);
    let todos = session.todos();

    let rent = todos.add(
        NewTodo::new("Pay rent")
            .due(date(2026, 1, 31))
            .recurring(Recurrence::Monthly),
    );
    let Some(ToggleOutcome::Completed {
        spawned: Some(next),
    }) = todos.toggle(&rent.id)
    else {
        panic!("expected a spawned occurrence");
    };
    assert_eq!(next.due_date, Some(date(2026, 2, 28)));
    assert!(!next.completed);
    assert_eq!(todos.todos().len(), 2);
}

#[test]
fn deleting_a_project_cascades_to_its_todos_only() {
    let clock = Rc::new(ManualClock::utc(start()));
    let session = session(Rc::new(MemoryStorage::new()), clock);

    let work = session.projects().add(NewProject::new("Work", "#34C759"));
    let eng = session
        .projects()
        .add(NewProject::new("Eng", "#FF9500").under(work.id.clone()));
    session
        .todos()
        .add(NewTodo::new("Ship release").in_project(work.id.clone()));
    let eng_todo = session
        .todos()
        .add(NewTodo::new("Fix build").in_project(eng.id.clone()));
    let inbox_todo = session.todos().add(NewTodo::new("Buy milk"));

    assert!(session.delete_project(&work.id));

    assert!(session.projects().get(&work.id).is_none());
    let orphan = session.projects().get(&eng.id).expect("subproject kept");
    assert_eq!(orphan.parent_id.as_deref(), Some(work.id.as_str()));

    let remaining: Vec<String> = session
        .todos()
        .todos()
        .iter()
        .map(|todo| todo.id.clone())
        .collect();
    assert_eq!(remaining, vec![eng_todo.id, inbox_todo.id]);
}

#[test]
fn project_listing_counts_open_todos_including_subtasks() {
    let clock = Rc::new(ManualClock::utc(start()));
    let mut session = session(Rc::new(MemoryStorage::new()), clock);

    let work = session.projects().add(NewProject::new("Work", "#34C759"));
    let report = session
        .todos()
        .add(NewTodo::new("Report").in_project(work.id.clone()));
    session.todos().add(
        NewTodo::new("Draft")
            .in_project(work.id.clone())
            .subtask_of(report.id.clone()),
    );
    let shipped = session
        .todos()
        .add(NewTodo::new("Shipped").in_project(work.id.clone()));
    session.todos().toggle(&shipped.id);
    session.todos().add(NewTodo::new("Buy milk"));

    let mut out = Vec::new();
    dispatch(
        &mut session,
        &Renderer::new(false, chrono_tz::UTC),
        Some(Command::Project(ProjectCommand::Ls)),
        &mut out,
    )
    .expect("project ls");
    let text = String::from_utf8(out).expect("utf8");

    let open_count = |name: &str| {
        text.lines()
            .find(|line| line.split_whitespace().nth(1) == Some(name))
            .and_then(|line| line.split_whitespace().last())
            .map(str::to_string)
    };
    assert_eq!(open_count("Work").as_deref(), Some("2"));
    assert_eq!(open_count("Inbox").as_deref(), Some("1"));
}

#[test]
fn subtask_extension_raises_parent_only_when_later() {
    let clock = Rc::new(ManualClock::utc(start()));
    let session = session(Rc::new(MemoryStorage::new()), clock);
    let todos = session.todos();

    let parent = todos.add(NewTodo::new("Launch").due(date(2026, 10, 25)));
    let child = todos.add(
        NewTodo::new("Write notes")
            .due(date(2026, 10, 20))
            .subtask_of(parent.id.clone()),
    );

    assert_eq!(todos.extend(&child.id, 2), Some(date(2026, 10, 22)));
    assert_eq!(
        todos.get(&parent.id).and_then(|todo| todo.due_date),
        Some(date(2026, 10, 25))
    );

    assert_eq!(todos.extend(&child.id, 7), Some(date(2026, 10, 29)));
    assert_eq!(
        todos.get(&parent.id).and_then(|todo| todo.due_date),
        Some(date(2026, 10, 29))
    );
}

#[test]
fn import_applies_valid_entries_and_rejects_malformed_json() {
    let clock = Rc::new(ManualClock::utc(start()));
    let session = session(Rc::new(MemoryStorage::new()), clock);
    let existing = session.todos().add(NewTodo::new("Keep me"));

    let err = session.import("{\"todos\": [").expect_err("malformed");
    assert!(matches!(err, ImportError::Malformed(_)));
    assert_eq!(session.todos().todos().len(), 1);
    assert_eq!(session.todos().todos()[0].id, existing.id);

    let summary = session
        .import(
            r#"{"version": 1, "todos": [
                {"id": "a", "title": "Pay rent", "completed": false, "projectId": "inbox"},
                {"id": "b", "completed": false, "projectId": "inbox"}
            ]}"#,
        )
        .expect("import");
    assert_eq!(summary.todos, Some(1));
    assert_eq!(summary.projects, None);
    let titles: Vec<String> = session
        .todos()
        .todos()
        .iter()
        .map(|todo| todo.title.clone())
        .collect();
    assert_eq!(titles, vec!["Pay rent"]);
    assert!(session.projects().get("inbox").is_some());
}

#[test]
fn export_round_trips_through_import() {
    let clock = Rc::new(ManualClock::utc(start()));
    let source = session(Rc::new(MemoryStorage::new()), clock.clone());
    let work = source.projects().add(NewProject::new("Work", "#34C759"));
    source.todos().add(
        NewTodo::new("Quarterly report")
            .in_project(work.id.clone())
            .due(date(2026, 12, 31))
            .with_description("numbers"),
    );
    let exported = source.export().expect("export");

    let target = session(Rc::new(MemoryStorage::new()), clock);
    target.import(&exported).expect("import");
    assert_eq!(*target.todos().todos(), *source.todos().todos());
    assert_eq!(*target.projects().projects(), *source.projects().projects());
}

#[test]
fn tabs_converge_through_storage_events() {
    let clock = Rc::new(ManualClock::utc(start()));
    let storage = MemoryStorage::new();
    let other = storage.context();
    let mut first = session(Rc::new(storage), clock.clone());
    let mut second = session(Rc::new(other), clock.clone());

    first.todos().add(NewTodo::new("From tab one"));
    first.view().set_view_mode(ViewMode::All);
    clock.advance(Duration::milliseconds(300));
    assert_eq!(first.tick().writes, 2);

    let report = second.tick();
    assert_eq!(report.remote_applied, 2);
    assert_eq!(second.todos().todos()[0].title, "From tab one");
    assert_eq!(second.view().view_mode(), ViewMode::All);

    second.todos().add(NewTodo::new("From tab two"));
    clock.advance(Duration::milliseconds(300));
    second.tick();
    first.tick();
    assert_eq!(first.todos().todos(), second.todos().todos());
    assert_eq!(first.todos().todos().len(), 2);
}

#[test]
fn file_backed_sessions_persist_and_sync() {
    let temp = tempdir().expect("tempdir");
    let clock = Rc::new(ManualClock::utc(start()));

    let writer_storage = FileStorage::open(temp.path()).expect("open storage");
    let mut writer = session(Rc::new(writer_storage), clock.clone());
    let reader_storage = FileStorage::open(temp.path()).expect("open storage");
    let mut reader = session(Rc::new(reader_storage), clock.clone());

    let todo = writer.todos().add(NewTodo::new("Water plants"));
    clock.advance(Duration::milliseconds(300));
    writer.tick();

    reader.tick();
    assert_eq!(
        reader.todos().get(&todo.id).map(|todo| todo.title),
        Some("Water plants".to_string())
    );

    writer.todos().toggle(&todo.id);
    writer.shutdown();

    let reopened = session(
        Rc::new(FileStorage::open(temp.path()).expect("reopen")),
        clock,
    );
    assert!(reopened.todos().get(&todo.id).expect("persisted").completed);
}

#[test]
fn search_is_blank_safe_and_case_insensitive() {
    let clock = Rc::new(ManualClock::utc(start()));
    let session = session(Rc::new(MemoryStorage::new()), clock.clone());
    let garden = session.projects().add(NewProject::new("Garden", "#00C7BE"));
    session
        .todos()
        .add(NewTodo::new("Buy seeds").in_project(garden.id.clone()));
    session
        .todos()
        .add(NewTodo::new("Call bank").with_description("about GARDEN loan"));
    session.todos().add(NewTodo::new("Laundry"));

    let todos = session.todos().todos();
    let projects = session.projects().projects();
    assert!(search(&todos, &projects, "").is_empty());
    assert!(search(&todos, &projects, " \t ").is_empty());

    let found: Vec<String> = search(&todos, &projects, "garden")
        .into_iter()
        .map(|todo| todo.title)
        .collect();
    assert_eq!(found, vec!["Buy seeds", "Call bank"]);
    assert_eq!(clock.today(), date(2026, 10, 18));
}
