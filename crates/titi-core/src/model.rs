use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datetime::{add_days, add_months, iso_date, iso_datetime};

pub const INBOX_PROJECT_ID: &str = "inbox";
pub const INBOX_PROJECT_NAME: &str = "Inbox";

pub const PROJECT_COLORS: [&str; 8] = [
    "#007AFF", "#34C759", "#FF9500", "#FF3B30", "#AF52DE", "#5856D6", "#FF2D55", "#00C7BE",
];

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Sort key, highest priority first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "l" => Ok(Priority::Low),
            "medium" | "m" => Ok(Priority::Medium),
            "high" | "h" => Ok(Priority::High),
            other => Err(anyhow!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn is_recurring(self) -> bool {
        self != Recurrence::None
    }

    /// The due date of the next occurrence after `due`.
    pub fn advance(self, due: NaiveDate) -> NaiveDate {
        match self {
            Recurrence::None => due,
            Recurrence::Daily => add_days(due, 1),
            Recurrence::Weekly => add_days(due, 7),
            Recurrence::Monthly => add_months(due, 1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Recurrence::None => "none",
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }
}

impl FromStr for Recurrence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Recurrence::None),
            "daily" | "day" => Ok(Recurrence::Daily),
            "weekly" | "week" => Ok(Recurrence::Weekly),
            "monthly" | "month" => Ok(Recurrence::Monthly),
            other => Err(anyhow!("unknown recurrence: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ViewMode {
    #[default]
    Today,
    Upcoming,
    Project,
    All,
    Calendar,
    Overdue,
    NoDate,
    HighPriority,
    Search,
}

impl ViewMode {
    pub const ALL: [ViewMode; 9] = [
        ViewMode::Today,
        ViewMode::Upcoming,
        ViewMode::Project,
        ViewMode::All,
        ViewMode::Calendar,
        ViewMode::Overdue,
        ViewMode::NoDate,
        ViewMode::HighPriority,
        ViewMode::Search,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ViewMode::Today => "today",
            ViewMode::Upcoming => "upcoming",
            ViewMode::Project => "project",
            ViewMode::All => "all",
            ViewMode::Calendar => "calendar",
            ViewMode::Overdue => "overdue",
            ViewMode::NoDate => "no-date",
            ViewMode::HighPriority => "high-priority",
            ViewMode::Search => "search",
        }
    }

    pub fn is_smart_list(self) -> bool {
        matches!(
            self,
            ViewMode::Overdue | ViewMode::NoDate | ViewMode::HighPriority
        )
    }
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ViewMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| anyhow!("unknown view mode: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub completed: bool,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "iso_date::option"
    )]
    pub due_date: Option<NaiveDate>,

    #[serde(with = "iso_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "iso_datetime::option"
    )]
    pub completed_at: Option<DateTime<Utc>>,

    pub project_id: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(default)]
    pub recurrence: Recurrence,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "iso_datetime::option"
    )]
    pub reminder: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Todo {
    pub fn from_new(new: NewTodo, id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: new.title,
            description: new.description,
            completed: new.completed,
            due_date: new.due_date,
            created_at: now,
            completed_at: new.completed_at,
            project_id: new.project_id,
            priority: new.priority,
            parent_id: new.parent_id,
            recurrence: new.recurrence.unwrap_or_default(),
            reminder: new.reminder,
            extra: BTreeMap::new(),
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_top_level_incomplete(&self) -> bool {
        self.is_top_level() && !self.completed
    }
}

/// Fields supplied when creating a todo; id and `createdAt` are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewTodo {
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub due_date: Option<NaiveDate>,
    pub project_id: String,
    pub priority: Priority,
    pub parent_id: Option<String>,
    pub recurrence: Option<Recurrence>,
    pub reminder: Option<DateTime<Utc>>,
}

impl NewTodo {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            completed: false,
            completed_at: None,
            due_date: None,
            project_id: INBOX_PROJECT_ID.to_string(),
            priority: Priority::default(),
            parent_id: None,
            recurrence: None,
            reminder: None,
        }
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn due(mut self, date: NaiveDate) -> Self {
        self.due_date = Some(date);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn subtask_of(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn recurring(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn remind_at(mut self, at: DateTime<Utc>) -> Self {
        self.reminder = Some(at);
        self
    }
}

/// Partial update of a todo. `None` leaves a field alone; for optional
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct TodoPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub completed: Option<bool>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub due_date: Option<Option<NaiveDate>>,
    pub project_id: Option<String>,
    pub priority: Option<Priority>,
    pub parent_id: Option<Option<String>>,
    pub recurrence: Option<Recurrence>,
    pub reminder: Option<Option<DateTime<Utc>>>,
}

impl TodoPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.completed.is_none()
            && self.completed_at.is_none()
            && self.due_date.is_none()
            && self.project_id.is_none()
            && self.priority.is_none()
            && self.parent_id.is_none()
            && self.recurrence.is_none()
            && self.reminder.is_none()
    }

    pub fn apply(self, todo: &mut Todo) {
        if let Some(title) = self.title {
            todo.title = title;
        }
        if let Some(description) = self.description {
            todo.description = description;
        }
        if let Some(completed) = self.completed {
            todo.completed = completed;
        }
        if let Some(completed_at) = self.completed_at {
            todo.completed_at = completed_at;
        }
        if let Some(due_date) = self.due_date {
            todo.due_date = due_date;
        }
        if let Some(project_id) = self.project_id {
            todo.project_id = project_id;
        }
        if let Some(priority) = self.priority {
            todo.priority = priority;
        }
        if let Some(parent_id) = self.parent_id {
            todo.parent_id = parent_id;
        }
        if let Some(recurrence) = self.recurrence {
            todo.recurrence = recurrence;
        }
        if let Some(reminder) = self.reminder {
            todo.reminder = reminder;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,

    pub name: String,

    pub color: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(with = "iso_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub order: usize,
}

impl Project {
    pub fn inbox(now: DateTime<Utc>) -> Self {
        Self {
            id: INBOX_PROJECT_ID.to_string(),
            name: INBOX_PROJECT_NAME.to_string(),
            color: PROJECT_COLORS[0].to_string(),
            parent_id: None,
            created_at: now,
            order: 0,
        }
    }

    pub fn is_inbox(&self) -> bool {
        self.id == INBOX_PROJECT_ID
    }
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub color: String,
    pub parent_id: Option<String>,
}

impl NewProject {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            parent_id: None,
        }
    }

    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub parent_id: Option<Option<String>>,
    pub order: Option<usize>,
}

impl ProjectPatch {
    pub fn apply(self, project: &mut Project) {
        if let Some(name) = self.name {
            project.name = name;
        }
        if let Some(color) = self.color {
            project.color = color;
        }
        if let Some(parent_id) = self.parent_id {
            project.parent_id = parent_id;
        }
        if let Some(order) = self.order {
            project.order = order;
        }
    }
}
