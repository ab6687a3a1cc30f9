use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};

use anyhow::{
  Context,
  anyhow
};
use chrono::Duration;
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::reminders::{
  DEFAULT_CHECK_INTERVAL_SECS,
  DEFAULT_WINDOW_HOURS
};
use crate::storage::DEFAULT_DEBOUNCE_MS;

pub const RC_ENV_VAR: &str = "TITIRC";
pub const RC_FILE_NAME: &str = ".titirc";
pub const DEFAULT_APP_NAME: &str = "TiTi";

/// Flat `key = value` settings from the
/// rc file and command-line overrides.
#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Default for Config {
  fn default() -> Self {
    let mut map = HashMap::new();
    for (key, value) in [
      ("data.location", "~/.titi".to_string()),
      (
        "storage.debounce_ms",
        DEFAULT_DEBOUNCE_MS.to_string()
      ),
      (
        "reminder.interval_secs",
        DEFAULT_CHECK_INTERVAL_SECS
          .to_string()
      ),
      (
        "reminder.window_hours",
        DEFAULT_WINDOW_HOURS.to_string()
      ),
      (
        "app.name",
        DEFAULT_APP_NAME.to_string()
      ),
      ("notifications", "on".to_string()),
      ("color", "on".to_string())
    ] {
      map.insert(key.to_string(), value);
    }
    Self {
      map,
      loaded_files: vec![]
    }
  }
}

impl Config {
  /// Defaults plus the rc file named by
  /// `rc_override`, `$TITIRC` or
  /// `~/.titirc`, in that order.
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let env_rc =
      std::env::var(RC_ENV_VAR).ok();
    let rc = resolve_rc_path(
      rc_override,
      env_rc.as_deref()
    )?;
    Self::load_from(rc.as_deref())
  }

  pub fn load_from(
    rc: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::default();
    match rc {
      | Some(path) => {
        info!(rc = %path.display(), "loading rc file");
        cfg.load_file(path)?;
      }
      | None => {
        warn!(
          "no rc file found; using \
           defaults"
        );
      }
    }
    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self
      .map
      .get(key)
      .map(|v| parse_bool(v))
  }

  /// Whole number under `key`; an
  /// unparsable value is an error
  /// naming the key.
  pub fn get_i64(
    &self,
    key: &str
  ) -> anyhow::Result<Option<i64>> {
    let Some(raw) = self.map.get(key)
    else {
      return Ok(None);
    };
    let value = raw
      .trim()
      .parse::<i64>()
      .with_context(|| {
        format!(
          "invalid number for {key}: \
           {raw}"
        )
      })?;
    Ok(Some(value))
  }

  pub fn iter(
    &self
  ) -> impl Iterator<Item = (&String, &String)>
  {
    self.map.iter()
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let line = match raw_line
        .split_once('#')
      {
        | Some((before, _)) => {
          before.trim()
        }
        | None => raw_line.trim()
      };
      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if self
          .loaded_files
          .contains(&include_path)
        {
          warn!(include = %include_path.display(), "include cycle; skipping");
        } else if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

/// Typed, validated view of a
/// [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
  pub debounce:          Duration,
  pub reminder_interval: Duration,
  pub reminder_window:   Duration,
  pub app_name:          String,
  pub notifications:     bool,
  pub color:             bool,
  pub timezone:          Option<String>
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      debounce:          Duration::milliseconds(
        DEFAULT_DEBOUNCE_MS
      ),
      reminder_interval: Duration::seconds(
        DEFAULT_CHECK_INTERVAL_SECS
      ),
      reminder_window:   Duration::hours(
        DEFAULT_WINDOW_HOURS
      ),
      app_name:          DEFAULT_APP_NAME
        .to_string(),
      notifications:     true,
      color:             true,
      timezone:          None
    }
  }
}

impl Settings {
  #[tracing::instrument(skip(cfg))]
  pub fn from_config(
    cfg: &Config
  ) -> anyhow::Result<Self> {
    let defaults = Settings::default();

    let debounce = match cfg
      .get_i64("storage.debounce_ms")?
    {
      | Some(ms) if ms < 0 => {
        return Err(anyhow!(
          "storage.debounce_ms must not \
           be negative: {ms}"
        ));
      }
      | Some(ms) => {
        in_range(
          "storage.debounce_ms",
          Duration::try_milliseconds(ms)
        )?
      }
      | None => defaults.debounce
    };

    let reminder_interval =
      match positive(
        cfg,
        "reminder.interval_secs"
      )? {
        | Some(secs) => {
          in_range(
            "reminder.interval_secs",
            Duration::try_seconds(secs)
          )?
        }
        | None => {
          defaults.reminder_interval
        }
      };

    let reminder_window = match positive(
      cfg,
      "reminder.window_hours"
    )? {
      | Some(hours) => {
        in_range(
          "reminder.window_hours",
          Duration::try_hours(hours)
        )?
      }
      | None => defaults.reminder_window
    };

    let app_name = cfg
      .get("app.name")
      .filter(|name| {
        !name.trim().is_empty()
      })
      .unwrap_or(defaults.app_name);

    Ok(Self {
      debounce,
      reminder_interval,
      reminder_window,
      app_name,
      notifications: cfg
        .get_bool("notifications")
        .unwrap_or(true),
      color: cfg
        .get_bool("color")
        .unwrap_or(true),
      timezone: cfg
        .get("timezone")
        .filter(|tz| !tz.trim().is_empty())
    })
  }
}

fn in_range(
  key: &str,
  value: Option<Duration>
) -> anyhow::Result<Duration> {
  value.ok_or_else(|| {
    anyhow!("{key} is out of range")
  })
}

fn positive(
  cfg: &Config,
  key: &str
) -> anyhow::Result<Option<i64>> {
  match cfg.get_i64(key)? {
    | Some(value) if value <= 0 => {
      Err(anyhow!(
        "{key} must be positive: \
         {value}"
      ))
    }
    | other => Ok(other)
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

fn resolve_rc_path(
  override_path: Option<&Path>,
  env_value: Option<&str>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    if path == Path::new("/dev/null") {
      return Ok(None);
    }
    return Ok(Some(path.to_path_buf()));
  }

  if let Some(env_value) = env_value {
    if env_value == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      env_value
    )));
  }

  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  let candidate =
    home.join(RC_FILE_NAME);
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".titi"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let expanded =
    expand_tilde(Path::new(include));
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::path::Path;

  use chrono::Duration;

  use super::{
    Config,
    Settings,
    resolve_data_dir,
    resolve_rc_path
  };

  #[test]
  fn rc_file_with_include_and_comments()
  {
    let dir = tempfile::tempdir()
      .expect("tempdir");
    fs::write(
      dir.path().join("extra.rc"),
      "app.name = Focus\n"
    )
    .expect("write include");
    let rc = dir.path().join("titirc");
    fs::write(
      &rc,
      "# reminders\nreminder.interval_secs \
       = 30 # twice a minute\ninclude \
       extra.rc\n\ncolor=off\n"
    )
    .expect("write rc");

    let cfg = Config::load_from(Some(&rc))
      .expect("load");
    assert_eq!(cfg.loaded_files.len(), 2);
    assert_eq!(
      cfg
        .get("reminder.interval_secs")
        .as_deref(),
      Some("30")
    );
    assert_eq!(
      cfg.get("app.name").as_deref(),
      Some("Focus")
    );
    assert_eq!(
      cfg.get_bool("color"),
      Some(false)
    );
  }

  #[test]
  fn malformed_line_is_an_error() {
    let dir = tempfile::tempdir()
      .expect("tempdir");
    let rc = dir.path().join("titirc");
    fs::write(&rc, "just words\n")
      .expect("write rc");
    let err = Config::load_from(Some(&rc))
      .expect_err("bad line");
    assert!(
      err
        .to_string()
        .contains("invalid config line")
    );
  }

  #[test]
  fn overrides_strip_rc_prefix() {
    let mut cfg = Config::default();
    cfg.apply_overrides([
      (
        "rc.storage.debounce_ms".to_string(),
        "50".to_string()
      ),
      (
        "timezone".to_string(),
        "Europe/Paris".to_string()
      )
    ]);
    let settings =
      Settings::from_config(&cfg)
        .expect("settings");
    assert_eq!(
      settings.debounce,
      Duration::milliseconds(50)
    );
    assert_eq!(
      settings.timezone.as_deref(),
      Some("Europe/Paris")
    );
  }

  #[test]
  fn defaults_become_settings() {
    let settings = Settings::from_config(
      &Config::default()
    )
    .expect("settings");
    assert_eq!(
      settings,
      Settings::default()
    );
  }

  #[test]
  fn invalid_numbers_name_the_key() {
    let mut cfg = Config::default();
    cfg.apply_overrides([(
      "reminder.window_hours".to_string(),
      "soon".to_string()
    )]);
    let err = Settings::from_config(&cfg)
      .expect_err("invalid");
    assert!(
      format!("{err:#}")
        .contains("reminder.window_hours")
    );

    let mut cfg = Config::default();
    cfg.apply_overrides([(
      "reminder.interval_secs"
        .to_string(),
      "0".to_string()
    )]);
    assert!(
      Settings::from_config(&cfg).is_err()
    );
  }

  #[test]
  fn oversized_durations_are_errors() {
    for key in [
      "reminder.interval_secs",
      "reminder.window_hours"
    ] {
      let mut cfg = Config::default();
      cfg.apply_overrides([(
        format!("rc.{key}"),
        i64::MAX.to_string()
      )]);
      let err = Settings::from_config(&cfg)
        .expect_err("out of range");
      assert_eq!(
        format!("{err:#}"),
        format!("{key} is out of range")
      );
    }
  }

  #[test]
  fn dev_null_disables_rc() {
    assert_eq!(
      resolve_rc_path(
        Some(Path::new("/dev/null")),
        None
      )
      .expect("resolve"),
      None
    );
    assert_eq!(
      resolve_rc_path(None, Some("/dev/null"))
        .expect("resolve"),
      None
    );
    assert_eq!(
      resolve_rc_path(
        None,
        Some("/tmp/custom.rc")
      )
      .expect("resolve")
      .as_deref(),
      Some(Path::new("/tmp/custom.rc"))
    );
  }

  #[test]
  fn data_dir_is_created() {
    let dir = tempfile::tempdir()
      .expect("tempdir");
    let target = dir.path().join("nested/data");
    let resolved = resolve_data_dir(
      &Config::default(),
      Some(&target)
    )
    .expect("resolve");
    assert_eq!(resolved, target);
    assert!(target.is_dir());
  }
}
