use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration as StdDuration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Datelike, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::cli::{AddArgs, Command, EditArgs, ListArgs, ProjectCommand};
use crate::datetime::{Clock, parse_date_expr, parse_datetime_expr};
use crate::filter::{ListRequest, TimelineFilter, group_upcoming, list_todos, month_grid, todos_on};
use crate::model::{
    NewProject, NewTodo, PROJECT_COLORS, Project, ProjectPatch, Todo, TodoPatch, ViewMode,
};
use crate::render::{Renderer, short_id};
use crate::session::Session;
use crate::todo_store::ToggleOutcome;

#[instrument(skip_all)]
pub fn dispatch<W: Write>(
    session: &mut Session,
    renderer: &Renderer,
    command: Option<Command>,
    out: &mut W,
) -> anyhow::Result<()> {
    let command = command.unwrap_or(Command::List(ListArgs {
        view: None,
        project: None,
        timeline: TimelineFilter::All,
        completed: false,
    }));
    debug!(?command, "dispatching");

    match command {
        Command::Add(args) => cmd_add(session, args, out),
        Command::List(args) => cmd_list(session, renderer, args, out),
        Command::Done { id } => cmd_done(session, &id, out),
        Command::Extend { id, days } => cmd_extend(session, &id, days, out),
        Command::Edit(args) => cmd_edit(session, args, out),
        Command::Rm { id } => cmd_rm(session, &id, out),
        Command::Subtasks { id } => cmd_subtasks(session, renderer, &id, out),
        Command::Project(sub) => cmd_project(session, renderer, sub, out),
        Command::Search { query } => cmd_search(session, renderer, &query.join(" "), out),
        Command::View { mode, project } => cmd_view(session, mode, project.as_deref(), out),
        Command::Calendar { year, month, day } => {
            cmd_calendar(session, renderer, year, month, day.as_deref(), out)
        }
        Command::Export { output } => cmd_export(session, output.as_deref(), out),
        Command::Import { path } => cmd_import(session, &path, out),
        Command::Remind => cmd_remind(session, out),
        Command::Watch { seconds } => cmd_watch(session, seconds, out),
    }
}

/// Finds the todo whose id is `token` or starts with it.
pub fn resolve_todo_id(todos: &[Todo], token: &str) -> anyhow::Result<String> {
    let token = token.trim();
    if let Some(todo) = todos.iter().find(|todo| todo.id == token) {
        return Ok(todo.id.clone());
    }
    let matches: Vec<&Todo> = todos
        .iter()
        .filter(|todo| !token.is_empty() && todo.id.starts_with(token))
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => Err(anyhow!("no todo matches id {token}")),
        many => Err(anyhow!("id {token} is ambiguous: {} todos match", many.len())),
    }
}

/// Finds a project by id, unique id prefix or name (ignoring case).
pub fn resolve_project_id(projects: &[Project], token: &str) -> anyhow::Result<String> {
    let token = token.trim();
    if let Some(project) = projects.iter().find(|project| project.id == token) {
        return Ok(project.id.clone());
    }

    let by_prefix: Vec<&Project> = projects
        .iter()
        .filter(|project| !token.is_empty() && project.id.starts_with(token))
        .collect();
    if let [only] = by_prefix.as_slice() {
        return Ok(only.id.clone());
    }

    let by_name: Vec<&Project> = projects
        .iter()
        .filter(|project| project.name.eq_ignore_ascii_case(token))
        .collect();
    match (by_name.as_slice(), by_prefix.len()) {
        ([only], _) => Ok(only.id.clone()),
        ([], 0) => Err(anyhow!("no project matches {token}")),
        ([], n) => Err(anyhow!("project {token} is ambiguous: {n} ids match")),
        (many, _) => Err(anyhow!(
            "project {token} is ambiguous: {} projects share the name",
            many.len()
        )),
    }
}

#[instrument(skip_all)]
fn cmd_add<W: Write>(session: &Session, args: AddArgs, out: &mut W) -> anyhow::Result<()> {
    info!("command add");
    let title = args.title.join(" ").trim().to_string();
    if title.is_empty() {
        return Err(anyhow!("title must not be empty"));
    }

    let clock = session.clock();
    let todos = session.todos().todos();
    let projects = session.projects().projects();

    let parent = match args.parent.as_deref() {
        Some(token) => {
            let id = resolve_todo_id(&todos, token)?;
            session.todos().get(&id)
        }
        None => None,
    };
    let project_id = match (args.project.as_deref(), &parent) {
        (Some(token), _) => resolve_project_id(&projects, token)?,
        (None, Some(parent)) => parent.project_id.clone(),
        (None, None) => crate::model::INBOX_PROJECT_ID.to_string(),
    };

    let mut new = NewTodo::new(title).in_project(project_id);
    if let Some(parent) = parent {
        new = new.subtask_of(parent.id);
    }
    if let Some(expr) = args.due.as_deref() {
        new = new.due(parse_date_expr(expr, clock.today())?);
    }
    if let Some(priority) = args.priority {
        new = new.with_priority(priority);
    }
    if let Some(recurrence) = args.recur {
        new = new.recurring(recurrence);
    }
    if let Some(description) = args.description {
        new = new.with_description(description);
    }
    if let Some(expr) = args.remind.as_deref() {
        new = new.remind_at(parse_datetime_expr(expr, clock.now(), clock.timezone())?);
    }

    let todo = session.todos().add(new);
    writeln!(out, "Created todo {} \"{}\".", short_id(&todo.id), todo.title)?;
    Ok(())
}

#[instrument(skip_all)]
fn cmd_list<W: Write>(
    session: &Session,
    renderer: &Renderer,
    args: ListArgs,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command list");
    let todos = session.todos().todos();
    let projects = session.projects().projects();
    let smart = session.todos().smart_lists();
    let today = session.clock().today();

    let selected = match args.project.as_deref() {
        Some(token) => Some(resolve_project_id(&projects, token)?),
        None => session.view().selected_project(),
    };
    let mode = match (args.view, &args.project) {
        (Some(mode), _) => mode,
        (None, Some(_)) => ViewMode::Project,
        (None, None) => session.view().view_mode(),
    };
    let query = session.view().search_query();

    let listed = list_todos(&ListRequest {
        mode,
        todos: &todos,
        projects: &projects,
        smart: &smart,
        selected_project: selected.as_deref(),
        search_query: &query,
        timeline: args.timeline,
        show_completed: args.completed,
        today,
    });

    writeln!(out, "{}", view_title(mode, selected.as_deref(), &projects, &query))?;
    if mode == ViewMode::Upcoming {
        let groups = group_upcoming(&listed, today);
        renderer.print_upcoming(out, &groups, &projects, today)
    } else {
        renderer.print_todo_table(out, &listed, &projects, today)
    }
}

fn view_title(mode: ViewMode, selected: Option<&str>, projects: &[Project], query: &str) -> String {
    match mode {
        ViewMode::Project => selected
            .and_then(|id| projects.iter().find(|project| project.id == id))
            .map(|project| project.name.clone())
            .unwrap_or_else(|| "Project".to_string()),
        ViewMode::Search => format!("Search: \"{query}\""),
        ViewMode::Today => "Today".to_string(),
        ViewMode::Upcoming => "Upcoming".to_string(),
        ViewMode::All => "All Tasks".to_string(),
        ViewMode::Calendar => "Calendar".to_string(),
        ViewMode::Overdue => "Overdue".to_string(),
        ViewMode::NoDate => "No Date".to_string(),
        ViewMode::HighPriority => "High Priority".to_string(),
    }
}

#[instrument(skip(session, out))]
fn cmd_done<W: Write>(session: &Session, token: &str, out: &mut W) -> anyhow::Result<()> {
    info!("command done");
    let id = resolve_todo_id(&session.todos().todos(), token)?;
    match session.todos().toggle(&id) {
        Some(ToggleOutcome::Completed { spawned }) => {
            writeln!(out, "Completed todo {}.", short_id(&id))?;
            if let Some(next) = spawned
                && let Some(due) = next.due_date
            {
                writeln!(
                    out,
                    "Next occurrence {} due {}.",
                    short_id(&next.id),
                    due.format("%Y-%m-%d")
                )?;
            }
        }
        Some(ToggleOutcome::Reopened) => writeln!(out, "Reopened todo {}.", short_id(&id))?,
        None => warn!(id = %id, "todo disappeared before toggle"),
    }
    Ok(())
}

#[instrument(skip(session, out))]
fn cmd_extend<W: Write>(
    session: &Session,
    token: &str,
    days: i64,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command extend");
    let id = resolve_todo_id(&session.todos().todos(), token)?;
    let due = session
        .todos()
        .extend(&id, days)
        .ok_or_else(|| anyhow!("todo {id} disappeared"))?;
    writeln!(out, "Todo {} now due {}.", short_id(&id), due.format("%Y-%m-%d"))?;
    Ok(())
}

#[instrument(skip_all)]
fn cmd_edit<W: Write>(session: &Session, args: EditArgs, out: &mut W) -> anyhow::Result<()> {
    info!("command edit");
    let clock = session.clock();
    let id = resolve_todo_id(&session.todos().todos(), &args.id)?;

    let mut patch = TodoPatch {
        title: args.title.map(|title| title.trim().to_string()),
        priority: args.priority,
        recurrence: args.recur,
        ..TodoPatch::default()
    };
    if let Some(title) = &patch.title
        && title.is_empty()
    {
        return Err(anyhow!("title must not be empty"));
    }
    if let Some(token) = args.project.as_deref() {
        patch.project_id = Some(resolve_project_id(&session.projects().projects(), token)?);
    }
    if args.no_due {
        patch.due_date = Some(None);
    } else if let Some(expr) = args.due.as_deref() {
        patch.due_date = Some(Some(parse_date_expr(expr, clock.today())?));
    }
    if args.no_desc {
        patch.description = Some(None);
    } else if let Some(description) = args.description {
        patch.description = Some(Some(description));
    }
    if args.no_remind {
        patch.reminder = Some(None);
    } else if let Some(expr) = args.remind.as_deref() {
        let at = parse_datetime_expr(expr, clock.now(), clock.timezone())?;
        patch.reminder = Some(Some(at));
    }

    if patch.is_empty() {
        writeln!(out, "Nothing to change.")?;
        return Ok(());
    }
    let todo = session
        .todos()
        .update(&id, patch)
        .ok_or_else(|| anyhow!("todo {id} disappeared"))?;
    writeln!(out, "Modified todo {} \"{}\".", short_id(&todo.id), todo.title)?;
    Ok(())
}

#[instrument(skip(session, out))]
fn cmd_rm<W: Write>(session: &Session, token: &str, out: &mut W) -> anyhow::Result<()> {
    info!("command rm");
    let id = resolve_todo_id(&session.todos().todos(), token)?;
    let removed = session.todos().delete(&id);
    writeln!(out, "Deleted {removed} todo(s).")?;
    Ok(())
}

#[instrument(skip(session, renderer, out))]
fn cmd_subtasks<W: Write>(
    session: &Session,
    renderer: &Renderer,
    token: &str,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command subtasks");
    let id = resolve_todo_id(&session.todos().todos(), token)?;
    let todo = session
        .todos()
        .get(&id)
        .ok_or_else(|| anyhow!("todo {id} disappeared"))?;
    let subtasks = session.todos().subtasks(&id);
    let projects = session.projects().projects();
    let project_name = session.projects().name_of(&todo.project_id);

    renderer.print_todo_info(out, &todo, project_name.as_deref(), &subtasks)?;
    writeln!(out)?;
    renderer.print_todo_table(out, &subtasks, &projects, session.clock().today())
}

#[instrument(skip_all)]
fn cmd_project<W: Write>(
    session: &Session,
    renderer: &Renderer,
    command: ProjectCommand,
    out: &mut W,
) -> anyhow::Result<()> {
    let projects = session.projects().projects();
    match command {
        ProjectCommand::Add {
            name,
            color,
            parent,
        } => {
            info!("command project add");
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(anyhow!("project name must not be empty"));
            }
            let color = color.unwrap_or_else(|| {
                PROJECT_COLORS[projects.len() % PROJECT_COLORS.len()].to_string()
            });
            let mut new = NewProject::new(name, color);
            if let Some(token) = parent.as_deref() {
                new = new.under(resolve_project_id(&projects, token)?);
            }
            let project = session.projects().add(new);
            writeln!(out, "Created project {} \"{}\".", short_id(&project.id), project.name)?;
        }
        ProjectCommand::Rm { project } => {
            info!("command project rm");
            let id = resolve_project_id(&projects, &project)?;
            let before = session.todos().todos().len();
            if !session.delete_project(&id) {
                return Err(anyhow!("project {id} cannot be deleted"));
            }
            let removed = before.saturating_sub(session.todos().todos().len());
            writeln!(out, "Deleted project {} and {removed} todo(s).", short_id(&id))?;
        }
        ProjectCommand::Ls => {
            info!("command project ls");
            let open_counts: HashMap<String, usize> = projects
                .iter()
                .map(|project| {
                    let open = session
                        .todos()
                        .project_todos(&project.id)
                        .iter()
                        .filter(|todo| !todo.completed)
                        .count();
                    (project.id.clone(), open)
                })
                .collect();
            renderer.print_projects(out, &projects, &open_counts)?;
        }
        ProjectCommand::Rename { project, name } => {
            info!("command project rename");
            let id = resolve_project_id(&projects, &project)?;
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(anyhow!("project name must not be empty"));
            }
            session.projects().update(
                &id,
                ProjectPatch {
                    name: Some(name.clone()),
                    ..ProjectPatch::default()
                },
            );
            writeln!(out, "Renamed project {} to \"{name}\".", short_id(&id))?;
        }
    }
    Ok(())
}

#[instrument(skip(session, renderer, out))]
fn cmd_search<W: Write>(
    session: &Session,
    renderer: &Renderer,
    query: &str,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command search");
    session.view().set_search_query(query);
    session.view().set_view_mode(ViewMode::Search);
    let results = session.search_results();
    writeln!(out, "Search: \"{query}\" ({} match(es))", results.len())?;
    renderer.print_todo_table(
        out,
        &results,
        &session.projects().projects(),
        session.clock().today(),
    )
}

#[instrument(skip(session, out))]
fn cmd_view<W: Write>(
    session: &Session,
    mode: ViewMode,
    project: Option<&str>,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command view");
    if let Some(token) = project {
        let id = resolve_project_id(&session.projects().projects(), token)?;
        session.view().set_selected_project(Some(id));
    } else if mode == ViewMode::Project && session.view().selected_project().is_none() {
        return Err(anyhow!("the project view needs --project"));
    }
    session.view().set_view_mode(mode);
    writeln!(out, "View set to {mode}.")?;
    Ok(())
}

#[instrument(skip(session, renderer, out))]
fn cmd_calendar<W: Write>(
    session: &Session,
    renderer: &Renderer,
    year: Option<i32>,
    month: Option<u32>,
    day: Option<&str>,
    out: &mut W,
) -> anyhow::Result<()> {
    info!("command calendar");
    let today = session.clock().today();
    let todos = session.todos().todos();

    if let Some(expr) = day {
        let date = parse_date_expr(expr, today)?;
        writeln!(out, "{}", date.format("%A, %B %-d, %Y"))?;
        let listed = todos_on(&todos, date);
        return renderer.print_todo_table(out, &listed, &session.projects().projects(), today);
    }

    let year = year.unwrap_or(today.year());
    let month = month.unwrap_or(today.month());
    let grid = month_grid(&todos, year, month)?;
    let title = grid
        .iter()
        .flatten()
        .find(|cell| cell.in_month)
        .map(|cell| cell.date.format("%B %Y").to_string())
        .unwrap_or_default();
    renderer.print_month(out, &title, &grid, today)
}

#[instrument(skip(session, out))]
fn cmd_export<W: Write>(session: &Session, output: Option<&Path>, out: &mut W) -> anyhow::Result<()> {
    info!("command export");
    let json = session.export()?;
    match output {
        Some(path) => {
            fs::write(path, format!("{json}\n"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            writeln!(out, "Exported to {}.", path.display())?;
        }
        None => writeln!(out, "{json}")?,
    }
    Ok(())
}

#[instrument(skip(session, out))]
fn cmd_import<W: Write>(session: &Session, path: &Path, out: &mut W) -> anyhow::Result<()> {
    info!("command import");
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let summary = session
        .import(&raw)
        .with_context(|| format!("failed to import {}", path.display()))?;

    match summary.todos {
        Some(count) => writeln!(out, "Imported {count} todo(s).")?,
        None => writeln!(out, "Todos left unchanged.")?,
    }
    match summary.projects {
        Some(count) => writeln!(out, "Imported {count} project(s).")?,
        None => writeln!(out, "Projects left unchanged.")?,
    }
    Ok(())
}

#[instrument(skip_all)]
fn cmd_remind<W: Write>(session: &mut Session, out: &mut W) -> anyhow::Result<()> {
    info!("command remind");
    let report = session.tick();
    writeln!(out, "Fired {} reminder(s).", report.reminders_fired)?;
    Ok(())
}

/// Runs the event loop for `seconds`, sleeping until the next deadline.
#[instrument(skip(session, out))]
fn cmd_watch<W: Write>(session: &mut Session, seconds: u64, out: &mut W) -> anyhow::Result<()> {
    info!("command watch");
    let clock = std::rc::Rc::clone(session.clock());
    let until = watch_deadline(clock.now(), seconds)?;
    let mut fired = 0;

    loop {
        fired += session.tick().reminders_fired;
        let now = clock.now();
        if now >= until {
            break;
        }
        let wake = session.next_deadline().map_or(until, |at| at.min(until));
        let nap = (wake - now)
            .to_std()
            .unwrap_or(StdDuration::ZERO)
            .max(StdDuration::from_millis(50));
        debug!(?nap, "sleeping until next deadline");
        std::thread::sleep(nap);
    }

    writeln!(out, "Watched for {seconds}s; fired {fired} reminder(s).")?;
    Ok(())
}

fn watch_deadline(now: DateTime<Utc>, seconds: u64) -> anyhow::Result<DateTime<Utc>> {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|span| now.checked_add_signed(span))
        .ok_or_else(|| anyhow!("watch duration of {seconds}s is out of range"))
}
