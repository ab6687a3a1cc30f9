use std::collections::HashMap;
use std::io::{IsTerminal, Write};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use unicode_width::UnicodeWidthStr;

use crate::filter::{DayCell, UpcomingGroups};
use crate::model::{Priority, Project, Recurrence, Todo};

/// Characters of an id shown in tables; any unique prefix is accepted
/// back.
pub const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
    tz: Tz,
}

impl Renderer {
    pub fn new(color: bool, tz: Tz) -> Self {
        Self { color, tz }
    }

    /// Colors only when enabled and stdout is a terminal.
    pub fn for_stdout(color: bool, tz: Tz) -> Self {
        Self::new(color && std::io::stdout().is_terminal(), tz)
    }

    #[tracing::instrument(skip_all, fields(count = todos.len()))]
    pub fn print_todo_table<W: Write>(
        &self,
        out: &mut W,
        todos: &[Todo],
        projects: &[Project],
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        if todos.is_empty() {
            writeln!(out, "No todos.")?;
            return Ok(());
        }

        let names: HashMap<&str, &str> = projects
            .iter()
            .map(|project| (project.id.as_str(), project.name.as_str()))
            .collect();

        let headers = ["ID", "", "Due", "Pri", "Project", "Title"]
            .map(String::from)
            .to_vec();

        let rows = todos
            .iter()
            .map(|todo| {
                let id = self.paint(short_id(&todo.id), "33");
                let check = if todo.completed { "x" } else { " " }.to_string();

                let due = todo
                    .due_date
                    .map(|date| date.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                let due = match todo.due_date {
                    Some(date) if date < today && !todo.completed => self.paint(&due, "31"),
                    Some(date) if date == today => self.paint(&due, "32"),
                    _ => due,
                };

                let priority = match todo.priority {
                    Priority::High => self.paint("H", "1;31"),
                    Priority::Medium => "M".to_string(),
                    Priority::Low => "L".to_string(),
                };

                let project = names
                    .get(todo.project_id.as_str())
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| todo.project_id.clone());

                let mut title = todo.title.clone();
                if todo.recurrence != Recurrence::None {
                    title.push_str(&format!(" ({})", todo.recurrence.as_str()));
                }
                if todo.reminder.is_some() {
                    title.push_str(" [reminder]");
                }

                vec![id, check, due, priority, project, title]
            })
            .collect();

        write_table(out, headers, rows)
    }

    pub fn print_upcoming<W: Write>(
        &self,
        out: &mut W,
        groups: &UpcomingGroups,
        projects: &[Project],
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        let mut printed = false;
        for (label, todos) in groups.sections() {
            if todos.is_empty() {
                continue;
            }
            if printed {
                writeln!(out)?;
            }
            writeln!(out, "{}", self.paint(label, "1"))?;
            self.print_todo_table(out, todos, projects, today)?;
            printed = true;
        }
        if !printed {
            writeln!(out, "No todos.")?;
        }
        Ok(())
    }

    pub fn print_todo_info<W: Write>(
        &self,
        out: &mut W,
        todo: &Todo,
        project_name: Option<&str>,
        subtasks: &[Todo],
    ) -> anyhow::Result<()> {
        writeln!(out, "id          {}", todo.id)?;
        writeln!(out, "title       {}", todo.title)?;
        if let Some(description) = &todo.description {
            writeln!(out, "description {description}")?;
        }
        writeln!(
            out,
            "status      {}",
            if todo.completed { "completed" } else { "pending" }
        )?;
        writeln!(out, "project     {}", project_name.unwrap_or(&todo.project_id))?;
        writeln!(out, "priority    {}", todo.priority.as_str())?;
        if let Some(due) = todo.due_date {
            writeln!(out, "due         {}", due.format("%Y-%m-%d"))?;
        }
        if todo.recurrence.is_recurring() {
            writeln!(out, "recurs      {}", todo.recurrence.as_str())?;
        }
        if let Some(reminder) = todo.reminder {
            writeln!(out, "reminder    {}", self.local_time(reminder))?;
        }
        if let Some(parent) = &todo.parent_id {
            writeln!(out, "parent      {}", short_id(parent))?;
        }
        writeln!(out, "created     {}", self.local_time(todo.created_at))?;
        if let Some(done) = todo.completed_at {
            writeln!(out, "completed   {}", self.local_time(done))?;
        }
        if !subtasks.is_empty() {
            let open = subtasks.iter().filter(|todo| !todo.completed).count();
            writeln!(out, "subtasks    {} ({open} open)", subtasks.len())?;
        }
        Ok(())
    }

    /// Projects as an indented tree with open todo counts. Projects whose
    /// parent no longer exists are listed at the top level.
    pub fn print_projects<W: Write>(
        &self,
        out: &mut W,
        projects: &[Project],
        open_counts: &HashMap<String, usize>,
    ) -> anyhow::Result<()> {
        let known: Vec<&str> = projects.iter().map(|project| project.id.as_str()).collect();
        let mut sorted: Vec<&Project> = projects.iter().collect();
        sorted.sort_by_key(|project| project.order);

        let roots = sorted.iter().filter(|project| {
            project
                .parent_id
                .as_deref()
                .is_none_or(|parent| !known.contains(&parent))
        });

        let headers = ["ID", "Name", "Color", "Open"].map(String::from).to_vec();
        let mut rows = Vec::with_capacity(projects.len());
        for root in roots {
            self.project_rows(root, 0, &sorted, open_counts, &mut rows);
        }
        write_table(out, headers, rows)
    }

    fn project_rows(
        &self,
        project: &Project,
        depth: usize,
        all: &[&Project],
        open_counts: &HashMap<String, usize>,
        rows: &mut Vec<Vec<String>>,
    ) {
        let id = if project.is_inbox() {
            project.id.clone()
        } else {
            short_id(&project.id).to_string()
        };
        rows.push(vec![
            self.paint(&id, "33"),
            format!("{}{}", "  ".repeat(depth), project.name),
            project.color.clone(),
            open_counts.get(&project.id).copied().unwrap_or(0).to_string(),
        ]);
        for child in all
            .iter()
            .filter(|child| child.parent_id.as_deref() == Some(project.id.as_str()))
        {
            self.project_rows(child, depth + 1, all, open_counts, rows);
        }
    }

    /// A month as a Monday-first grid. Each day shows `pending/completed`
    /// when it has todos.
    pub fn print_month<W: Write>(
        &self,
        out: &mut W,
        title: &str,
        grid: &[[DayCell; 7]; 6],
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(title, "1"))?;
        for day in ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"] {
            write!(out, "{day:<9}")?;
        }
        writeln!(out)?;

        for week in grid {
            for cell in week {
                let mut text = if cell.in_month {
                    cell.date.format("%e").to_string()
                } else {
                    "  ".to_string()
                };
                if cell.in_month && cell.pending + cell.completed > 0 {
                    text.push_str(&format!(" {}/{}", cell.pending, cell.completed));
                }
                let visible = UnicodeWidthStr::width(text.as_str());
                let padding = 9usize.saturating_sub(visible);
                let text = if cell.date == today {
                    self.paint(&text, "7")
                } else {
                    text
                };
                write!(out, "{text}{}", " ".repeat(padding))?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn local_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.tz).format("%Y-%m-%d %H:%M").to_string()
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

fn write_table<W: Write>(
    writer: &mut W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for (header, width) in headers.iter().zip(&widths) {
        write!(writer, "{header:width$} ")?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "")?;
    }
    writeln!(writer)?;

    for row in rows {
        for (cell, width) in row.iter().zip(&widths) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
