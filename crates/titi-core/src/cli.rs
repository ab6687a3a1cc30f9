use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::filter::TimelineFilter;
use crate::model::{Priority, Recurrence, ViewMode};

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "titi",
    version,
    about = "TiTi: todos, projects and reminders from the terminal",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "titirc")]
    pub titirc: Option<PathBuf>,

    #[arg(long = "data")]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Add a todo.
    Add(AddArgs),
    /// List todos for a view (defaults to the saved view).
    List(ListArgs),
    /// Toggle completion.
    Done { id: String },
    /// Push the due date out by a number of days.
    Extend {
        id: String,
        #[arg(allow_negative_numbers = true)]
        days: i64,
    },
    Edit(EditArgs),
    /// Delete a todo and its subtasks.
    Rm { id: String },
    Subtasks { id: String },
    #[command(subcommand)]
    Project(ProjectCommand),
    Search {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    /// Save the active view.
    View {
        mode: ViewMode,
        #[arg(long)]
        project: Option<String>,
    },
    Calendar {
        year: Option<i32>,
        month: Option<u32>,
        /// Show the todos of one day instead of the month.
        #[arg(long)]
        day: Option<String>,
    },
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    Import { path: PathBuf },
    /// Run one reminder check.
    Remind,
    /// Keep running: sync, persist and fire reminders.
    Watch {
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    #[arg(required = true, num_args = 1..)]
    pub title: Vec<String>,
    #[arg(short, long)]
    pub project: Option<String>,
    #[arg(short, long, allow_hyphen_values = true)]
    pub due: Option<String>,
    #[arg(short = 'P', long)]
    pub priority: Option<Priority>,
    #[arg(long)]
    pub parent: Option<String>,
    #[arg(short, long)]
    pub recur: Option<Recurrence>,
    #[arg(long = "desc")]
    pub description: Option<String>,
    #[arg(long)]
    pub remind: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    #[arg(long)]
    pub view: Option<ViewMode>,
    #[arg(short, long)]
    pub project: Option<String>,
    #[arg(short, long, default_value = "all")]
    pub timeline: TimelineFilter,
    #[arg(short, long)]
    pub completed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    pub id: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(short, long, allow_hyphen_values = true, conflicts_with = "no_due")]
    pub due: Option<String>,
    #[arg(long)]
    pub no_due: bool,
    #[arg(short = 'P', long)]
    pub priority: Option<Priority>,
    #[arg(short, long)]
    pub project: Option<String>,
    #[arg(short, long)]
    pub recur: Option<Recurrence>,
    #[arg(long = "desc", conflicts_with = "no_desc")]
    pub description: Option<String>,
    #[arg(long)]
    pub no_desc: bool,
    #[arg(long, conflicts_with = "no_remind")]
    pub remind: Option<String>,
    #[arg(long)]
    pub no_remind: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProjectCommand {
    Add {
        name: String,
        #[arg(short, long)]
        color: Option<String>,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Delete a project together with its todos.
    Rm { project: String },
    Ls,
    Rename { project: String, name: String },
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` (or `rc.key:value`) overrides out of
/// the argument list.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> PreprocessedArgs {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.")
            && let Some((k, v)) = rest.split_once('=').or_else(|| rest.split_once(':'))
        {
            debug!(key = %k, value = %v, "captured positional rc override");
            overrides.push((format!("rc.{k}"), v.to_string()));
            continue;
        }
        cleaned.push(arg);
    }

    PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use clap::Parser;

    use super::{Command, GlobalCli, ProjectCommand, preprocess_args};
    use crate::filter::TimelineFilter;
    use crate::model::{Priority, ViewMode};

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn positional_rc_overrides_are_extracted() {
        let pre = preprocess_args(&args(&["titi", "rc.color=off", "list", "rc.app.name:Focus"]));
        assert_eq!(pre.cleaned_args, args(&["titi", "list"]));
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.color".to_string(), "off".to_string()),
                ("rc.app.name".to_string(), "Focus".to_string()),
            ]
        );
    }

    #[test]
    fn parses_add_with_options() {
        let cli = GlobalCli::try_parse_from(args(&[
            "titi", "-v", "add", "Pay", "rent", "--due", "+3d", "-P", "high",
        ]))
        .expect("parse");
        assert_eq!(cli.verbose, 1);
        let Some(Command::Add(add)) = cli.command else {
            panic!("expected add");
        };
        assert_eq!(add.title, vec!["Pay", "rent"]);
        assert_eq!(add.due.as_deref(), Some("+3d"));
        assert_eq!(add.priority, Some(Priority::High));
    }

    #[test]
    fn parses_list_and_project_commands() {
        let cli = GlobalCli::try_parse_from(args(&[
            "titi", "list", "--view", "project", "-p", "work", "-t", "week",
        ]))
        .expect("parse");
        let Some(Command::List(list)) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(list.view, Some(ViewMode::Project));
        assert_eq!(list.timeline, TimelineFilter::Week);

        let cli = GlobalCli::try_parse_from(args(&["titi", "project", "rename", "work", "Job"]))
            .expect("parse");
        assert!(matches!(
            cli.command,
            Some(Command::Project(ProjectCommand::Rename { .. }))
        ));
    }

    #[test]
    fn extend_accepts_negative_days() {
        let cli = GlobalCli::try_parse_from(args(&["titi", "extend", "abc", "-2"])).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Command::Extend { days: -2, .. })
        ));
    }
}
