//! Whole-collection export and validated import.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::datetime::iso_datetime;
use crate::model::{Priority, Project, Recurrence, Todo};
use crate::project_store::ProjectStore;
use crate::todo_store::TodoStore;

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import data is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("import data must be a JSON object")]
    NotAnObject,

    #[error("import data holds no valid todos or projects")]
    NothingToImport,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportEnvelope<'a> {
    version: u32,
    #[serde(with = "iso_datetime")]
    exported_at: DateTime<Utc>,
    todos: &'a [Todo],
    projects: &'a [Project],
}

/// Pretty-printed export document.
pub fn export_data(
    todos: &[Todo],
    projects: &[Project],
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let envelope = ExportEnvelope {
        version: EXPORT_VERSION,
        exported_at: now,
        todos,
        projects,
    };
    Ok(serde_json::to_string_pretty(&envelope)?)
}

/// Categories that survived validation. A category is `None` when it was
/// absent or none of its entries were valid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportedData {
    pub todos: Option<Vec<Todo>>,
    pub projects: Option<Vec<Project>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub todos: Option<usize>,
    pub projects: Option<usize>,
}

/// Parses and validates an export document (or any subset of one).
#[tracing::instrument(skip(raw), fields(bytes = raw.len()))]
pub fn import_data(raw: &str, now: DateTime<Utc>) -> Result<ImportedData, ImportError> {
    let Value::Object(root) = serde_json::from_str::<Value>(raw)? else {
        return Err(ImportError::NotAnObject);
    };

    let todos = entries(&root, "todos")
        .map(|items| {
            items
                .iter()
                .filter_map(|item| import_todo(item, now))
                .collect::<Vec<_>>()
        })
        .filter(|todos| !todos.is_empty());

    let projects = entries(&root, "projects")
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter_map(|(idx, item)| import_project(item, idx, now))
                .collect::<Vec<_>>()
        })
        .filter(|projects| !projects.is_empty());

    if todos.is_none() && projects.is_none() {
        return Err(ImportError::NothingToImport);
    }

    debug!(
        todos = todos.as_ref().map_or(0, Vec::len),
        projects = projects.as_ref().map_or(0, Vec::len),
        "validated import"
    );
    Ok(ImportedData { todos, projects })
}

/// Replaces each imported category; absent categories are left alone.
#[tracing::instrument(skip_all)]
pub fn apply_import(
    data: ImportedData,
    todos: &TodoStore,
    projects: &ProjectStore,
) -> ImportSummary {
    let mut summary = ImportSummary::default();
    if let Some(imported) = data.projects {
        summary.projects = Some(imported.len());
        projects.replace_all(imported);
    }
    if let Some(imported) = data.todos {
        summary.todos = Some(imported.len());
        todos.replace_all(imported);
    }
    info!(todos = ?summary.todos, projects = ?summary.projects, "applied import");
    summary
}

fn entries<'a>(root: &'a Map<String, Value>, key: &str) -> Option<&'a Vec<Value>> {
    root.get(key).and_then(Value::as_array)
}

fn import_todo(item: &Value, now: DateTime<Utc>) -> Option<Todo> {
    let mut fields = item.as_object()?.clone();
    let shaped = fields.get("id").is_some_and(Value::is_string)
        && fields.get("title").is_some_and(Value::is_string)
        && fields.get("completed").is_some_and(Value::is_boolean)
        && fields.get("projectId").is_some_and(Value::is_string);
    if !shaped {
        debug!("dropping todo without id, title, completed or projectId");
        return None;
    }

    let priority = enum_field::<Priority>(&fields, "priority").unwrap_or_default();
    fields.insert("priority".into(), Value::from(priority.as_str()));
    let recurrence = enum_field::<Recurrence>(&fields, "recurrence").unwrap_or_default();
    fields.insert("recurrence".into(), Value::from(recurrence.as_str()));
    fill_created_at(&mut fields, now);

    match serde_json::from_value::<Todo>(Value::Object(fields)) {
        Ok(todo) => Some(todo),
        Err(err) => {
            warn!(error = %err, "dropping unreadable todo entry");
            None
        }
    }
}

fn import_project(item: &Value, idx: usize, now: DateTime<Utc>) -> Option<Project> {
    let mut fields = item.as_object()?.clone();
    let shaped = ["id", "name", "color"]
        .iter()
        .all(|key| fields.get(*key).is_some_and(Value::is_string));
    if !shaped {
        debug!("dropping project without id, name or color");
        return None;
    }

    fill_created_at(&mut fields, now);
    fields.entry("order").or_insert_with(|| Value::from(idx));

    match serde_json::from_value::<Project>(Value::Object(fields)) {
        Ok(project) => Some(project),
        Err(err) => {
            warn!(error = %err, "dropping unreadable project entry");
            None
        }
    }
}

/// The field read as `T` by its exact stored label; `None` when missing or
/// not one of the labels.
fn enum_field<T: DeserializeOwned>(fields: &Map<String, Value>, key: &str) -> Option<T> {
    let raw = fields.get(key)?;
    let parsed = serde_json::from_value::<T>(raw.clone()).ok();
    if parsed.is_none() {
        debug!(key, value = %raw, "replacing unknown value with default");
    }
    parsed
}

fn fill_created_at(fields: &mut Map<String, Value>, now: DateTime<Utc>) {
    if !fields.get("createdAt").is_some_and(Value::is_string) {
        fields.insert(
            "createdAt".into(),
            Value::from(now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
    }
}
