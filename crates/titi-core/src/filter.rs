use std::str::FromStr;

use anyhow::anyhow;
use chrono::{
  Datelike,
  NaiveDate
};
use tracing::trace;

use crate::datetime::{
  add_days,
  week_start
};
use crate::model::{
  Project,
  Todo,
  ViewMode
};
use crate::todo_store::SmartLists;
use crate::view::search;

/// Narrows the project view by due date.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq
)]
pub enum TimelineFilter {
  #[default]
  All,
  Today,
  /// Monday through Sunday of the
  /// current week.
  Week,
  Month
}

impl TimelineFilter {
  pub fn as_str(self) -> &'static str {
    match self {
      | TimelineFilter::All => "all",
      | TimelineFilter::Today => "today",
      | TimelineFilter::Week => "week",
      | TimelineFilter::Month => "month"
    }
  }

  fn admits(
    self,
    due: Option<NaiveDate>,
    today: NaiveDate
  ) -> bool {
    if self == TimelineFilter::All {
      return true;
    }
    let Some(due) = due else {
      return false;
    };
    match self {
      | TimelineFilter::All => true,
      | TimelineFilter::Today => {
        due == today
      }
      | TimelineFilter::Week => {
        week_start(due)
          == week_start(today)
      }
      | TimelineFilter::Month => {
        due.year() == today.year()
          && due.month() == today.month()
      }
    }
  }
}

impl FromStr for TimelineFilter {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "all" => Ok(TimelineFilter::All),
      | "today" => {
        Ok(TimelineFilter::Today)
      }
      | "week" => {
        Ok(TimelineFilter::Week)
      }
      | "month" => {
        Ok(TimelineFilter::Month)
      }
      | other => {
        Err(anyhow!(
          "unknown timeline filter: \
           {other}"
        ))
      }
    }
  }
}

/// Everything needed to compute one
/// visible list.
#[derive(Debug, Clone, Copy)]
pub struct ListRequest<'a> {
  pub mode:             ViewMode,
  pub todos:            &'a [Todo],
  pub projects:         &'a [Project],
  pub smart:            &'a SmartLists,
  pub selected_project: Option<&'a str>,
  pub search_query:     &'a str,
  pub timeline:         TimelineFilter,
  pub show_completed:   bool,
  pub today:            NaiveDate
}

/// The todos shown for a view, sorted
/// for display.
#[tracing::instrument(
  skip(request),
  fields(mode = %request.mode)
)]
pub fn list_todos(
  request: &ListRequest<'_>
) -> Vec<Todo> {
  let today = request.today;
  let top_level = || {
    request
      .todos
      .iter()
      .filter(|todo| todo.is_top_level())
  };

  let mut result: Vec<Todo> =
    match request.mode {
      | ViewMode::Search => {
        search(
          request.todos,
          request.projects,
          request.search_query
        )
      }
      | ViewMode::Overdue => {
        request.smart.overdue.clone()
      }
      | ViewMode::NoDate => {
        request.smart.no_date.clone()
      }
      | ViewMode::HighPriority => {
        request
          .smart
          .high_priority
          .clone()
      }
      | ViewMode::Today => {
        top_level()
          .filter(|todo| {
            todo.due_date == Some(today)
          })
          .cloned()
          .collect()
      }
      | ViewMode::Upcoming => {
        top_level()
          .filter(|todo| {
            todo
              .due_date
              .is_some_and(|due| {
                due >= today
              })
          })
          .cloned()
          .collect()
      }
      | ViewMode::Project => {
        match request.selected_project
        {
          | Some(project_id) => {
            top_level()
              .filter(|todo| {
                todo.project_id
                  == project_id
              })
              .filter(|todo| {
                request.timeline.admits(
                  todo.due_date,
                  today
                )
              })
              .cloned()
              .collect()
          }
          | None => Vec::new()
        }
      }
      | ViewMode::All
      | ViewMode::Calendar => {
        top_level().cloned().collect()
      }
    };

  if !request.show_completed
    && !request.mode.is_smart_list()
  {
    result.retain(|todo| !todo.completed);
  }

  sort_for_display(&mut result);
  trace!(
    count = result.len(),
    "listed todos"
  );
  result
}

/// Incomplete first, then dated before
/// undated by ascending date, then by
/// priority. Ties keep their order.
pub fn sort_for_display(
  todos: &mut [Todo]
) {
  todos.sort_by_key(|todo| {
    (
      todo.completed,
      todo.due_date.is_none(),
      todo.due_date,
      todo.priority.rank()
    )
  });
}

#[derive(
  Debug, Clone, Default, PartialEq,
)]
pub struct UpcomingGroups {
  pub today:     Vec<Todo>,
  pub tomorrow:  Vec<Todo>,
  pub this_week: Vec<Todo>,
  pub later:     Vec<Todo>
}

impl UpcomingGroups {
  pub fn sections(
    &self
  ) -> [(&'static str, &[Todo]); 4] {
    [
      ("Today", self.today.as_slice()),
      (
        "Tomorrow",
        self.tomorrow.as_slice()
      ),
      (
        "This Week",
        self.this_week.as_slice()
      ),
      ("Later", self.later.as_slice())
    ]
  }
}

/// Buckets an already sorted list by
/// how soon each todo is due.
pub fn group_upcoming(
  todos: &[Todo],
  today: NaiveDate
) -> UpcomingGroups {
  let tomorrow = add_days(today, 1);
  let this_week = week_start(today);
  let mut groups =
    UpcomingGroups::default();

  for todo in todos {
    let bucket = match todo.due_date {
      | Some(due) if due == today => {
        &mut groups.today
      }
      | Some(due) if due == tomorrow => {
        &mut groups.tomorrow
      }
      | Some(due)
        if week_start(due)
          == this_week =>
      {
        &mut groups.this_week
      }
      | _ => &mut groups.later
    };
    bucket.push(todo.clone());
  }
  groups
}

/// Top-level todos due on `date`,
/// complete or not.
pub fn todos_on(
  todos: &[Todo],
  date: NaiveDate
) -> Vec<Todo> {
  todos
    .iter()
    .filter(|todo| {
      todo.is_top_level()
        && todo.due_date == Some(date)
    })
    .cloned()
    .collect()
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub struct DayCell {
  pub date:      NaiveDate,
  pub in_month:  bool,
  pub pending:   usize,
  pub completed: usize
}

/// Six Monday-start weeks covering the
/// month, with per-day todo counts.
pub fn month_grid(
  todos: &[Todo],
  year: i32,
  month: u32
) -> anyhow::Result<[[DayCell; 7]; 6]>
{
  let first =
    NaiveDate::from_ymd_opt(year, month, 1)
      .ok_or_else(|| {
        anyhow!(
          "invalid month: {year}-{month}"
        )
      })?;
  let start = week_start(first);

  let mut grid = [[DayCell {
    date:      start,
    in_month:  false,
    pending:   0,
    completed: 0
  }; 7]; 6];

  for (week, row) in
    grid.iter_mut().enumerate()
  {
    for (weekday, cell) in
      row.iter_mut().enumerate()
    {
      let offset =
        (week * 7 + weekday) as i64;
      let date = add_days(start, offset);
      let day = todos_on(todos, date);
      let completed = day
        .iter()
        .filter(|todo| todo.completed)
        .count();
      *cell = DayCell {
        date,
        in_month: date.month() == month
          && date.year() == year,
        pending: day.len() - completed,
        completed
      };
    }
  }
  Ok(grid)
}
