pub mod cli;
pub mod commands;
pub mod config;
pub mod datetime;
pub mod events;
pub mod filter;
pub mod model;
pub mod project_store;
pub mod reminders;
pub mod render;
pub mod session;
pub mod storage;
pub mod todo_store;
pub mod transfer;
pub mod view;

use std::ffi::OsString;
use std::io;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

use crate::datetime::{
  SystemClock,
  resolve_timezone
};
use crate::reminders::LogNotifier;
use crate::session::Session;
use crate::storage::FileStorage;

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args);
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting titi CLI"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.titirc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );
  let settings =
    config::Settings::from_config(&cfg)
      .context("invalid configuration")?;

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let storage =
    FileStorage::open(&data_dir)
      .with_context(|| {
        format!(
          "failed to open storage at {}",
          data_dir.display()
        )
      })?;

  let tz = resolve_timezone(
    settings.timezone.as_deref(),
    Some(&data_dir)
  );
  let clock = Rc::new(SystemClock::new(tz));
  let notifier = Rc::new(
    LogNotifier::new(settings.notifications)
  );

  let mut session = Session::open(
    Rc::new(storage),
    clock,
    notifier,
    &settings
  );
  let renderer =
    render::Renderer::for_stdout(
      settings.color,
      tz
    );

  let mut out = io::stdout().lock();
  let result = commands::dispatch(
    &mut session,
    &renderer,
    cli.command,
    &mut out
  );
  session.shutdown();
  result?;

  info!("done");
  Ok(())
}
