use std::cell::Cell;
use std::fs;
use std::path::Path;

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Datelike,
  Duration,
  LocalResult,
  Months,
  NaiveDate,
  NaiveDateTime,
  TimeZone,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

pub const TIMEZONE_CONFIG_FILE: &str =
  "titi-time.toml";
pub const TIMEZONE_ENV_VAR: &str =
  "TITI_TIMEZONE";

/// Source of "now" for every store.
///
/// Calendar dates (due dates, "today", the start of the overdue window)
/// are evaluated in [`Clock::timezone`], instants are always UTC.
pub trait Clock {
  fn now(&self) -> DateTime<Utc>;

  fn timezone(&self) -> Tz;

  fn today(&self) -> NaiveDate {
    self
      .now()
      .with_timezone(&self.timezone())
      .date_naive()
  }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
  tz: Tz
}

impl SystemClock {
  pub fn new(tz: Tz) -> Self {
    Self {
      tz
    }
  }
}

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }

  fn timezone(&self) -> Tz {
    self.tz
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Cell<DateTime<Utc>>,
  tz:  Tz
}

impl ManualClock {
  pub fn new(
    now: DateTime<Utc>,
    tz: Tz
  ) -> Self {
    Self {
      now: Cell::new(now),
      tz
    }
  }

  pub fn utc(
    now: DateTime<Utc>
  ) -> Self {
    Self::new(now, chrono_tz::UTC)
  }

  pub fn set(
    &self,
    now: DateTime<Utc>
  ) {
    self.now.set(now);
  }

  pub fn advance(
    &self,
    by: Duration
  ) {
    self.now.set(self.now.get() + by);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    self.now.get()
  }

  fn timezone(&self) -> Tz {
    self.tz
  }
}

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Resolves the display timezone: env var, then the configured value,
/// then `titi-time.toml` in the data directory, then UTC.
pub fn resolve_timezone(
  configured: Option<&str>,
  data_dir: Option<&Path>
) -> Tz {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) =
      parse_timezone(&raw, TIMEZONE_ENV_VAR)
  {
    return tz;
  }

  if let Some(raw) = configured
    && let Some(tz) =
      parse_timezone(raw, "config")
  {
    return tz;
  }

  if let Some(dir) = data_dir
    && let Some(tz) =
      load_timezone_from_file(
        &dir.join(TIMEZONE_CONFIG_FILE)
      )
  {
    return tz;
  }

  chrono_tz::UTC
}

fn load_timezone_from_file(
  path: &Path
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// `date` moved by `days`, or `None` past the calendar range.
#[must_use]
pub fn checked_add_days(
  date: NaiveDate,
  days: i64
) -> Option<NaiveDate> {
  Duration::try_days(days).and_then(
    |delta| date.checked_add_signed(delta)
  )
}

#[must_use]
pub fn add_days(
  date: NaiveDate,
  days: i64
) -> NaiveDate {
  checked_add_days(date, days)
    .unwrap_or(date)
}

/// Calendar month addition; the day clamps to the end of the target
/// month.
#[must_use]
pub fn add_months(
  date: NaiveDate,
  months: u32
) -> NaiveDate {
  date
    .checked_add_months(Months::new(
      months
    ))
    .unwrap_or(date)
}

/// Monday of the week containing `date`.
#[must_use]
pub fn week_start(
  date: NaiveDate
) -> NaiveDate {
  let offset = date
    .weekday()
    .num_days_from_monday();
  add_days(date, -i64::from(offset))
}

pub fn to_utc_from_local(
  local_naive: NaiveDateTime,
  tz: Tz,
  context: &str
) -> anyhow::Result<DateTime<Utc>> {
  match tz.from_local_datetime(
    &local_naive
  ) {
    | LocalResult::Single(local_dt) => {
      Ok(local_dt.with_timezone(&Utc))
    }
    | LocalResult::Ambiguous(
      first,
      second
    ) => {
      tracing::warn!(
        context,
        first = %first,
        second = %second,
        "ambiguous local datetime; using earliest"
      );
      let chosen = if first <= second {
        first
      } else {
        second
      };
      Ok(chosen.with_timezone(&Utc))
    }
    | LocalResult::None => {
      Err(anyhow!(
        "local datetime does not \
         exist in configured \
         timezone: {context}"
      ))
    }
  }
}

/// Parses a due-date expression relative to `today`.
#[tracing::instrument(skip(today), fields(input = input))]
pub fn parse_date_expr(
  input: &str,
  today: NaiveDate
) -> anyhow::Result<NaiveDate> {
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();

  match lower.as_str() {
    | "today" => return Ok(today),
    | "tomorrow" => {
      return Ok(add_days(today, 1));
    }
    | "yesterday" => {
      return Ok(add_days(today, -1));
    }
    | _ => {}
  }

  if let Some(target_weekday) =
    parse_weekday_name(&lower)
  {
    return Ok(next_weekday_date(
      today,
      target_weekday
    ));
  }

  let rel_re = Regex::new(r"^(?P<sign>[+-])?(?P<num>\d+)(?P<unit>[dwm])$")
    .map_err(|e| anyhow!("internal regex compile failure: {e}"))?;

  if let Some(caps) =
    rel_re.captures(&lower)
  {
    let negative = caps
      .name("sign")
      .is_some_and(|m| m.as_str() == "-");
    let num: i64 = caps
      .name("num")
      .map(|m| m.as_str())
      .ok_or_else(|| {
        anyhow!(
          "missing relative amount"
        )
      })?
      .parse()
      .context(
        "invalid relative number"
      )?;
    let num =
      if negative { -num } else { num };
    let unit = caps
      .name("unit")
      .map(|m| m.as_str())
      .unwrap_or("d");

    return match unit {
      | "d" => {
        checked_add_days(today, num)
          .ok_or_else(|| {
            anyhow!(
              "relative date out of range"
            )
          })
      }
      | "w" => {
        num
          .checked_mul(7)
          .and_then(|days| {
            checked_add_days(today, days)
          })
          .ok_or_else(|| {
            anyhow!(
              "relative date out of range"
            )
          })
      }
      | "m" if num >= 0 => {
        let months = u32::try_from(num)
          .context(
            "relative month offset too large"
          )?;
        Ok(add_months(today, months))
      }
      | _ => {
        Err(anyhow!(
          "unsupported relative date: \
           {input}"
        ))
      }
    };
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%Y-%m-%d"
    )
  {
    return Ok(date);
  }

  Err(anyhow!(
    "unrecognized date expression: \
     {input}"
  ))
  .with_context(|| {
    "supported formats: \
     today/tomorrow/yesterday, \
     weekday names (e.g. monday), \
     +Nd/+Nw/+Nm, YYYY-MM-DD"
  })
}

/// Parses a reminder instant: RFC3339, local `YYYY-MM-DD HH:MM`, a
/// clock time (next occurrence) or `+Nh`/`+Nm` from now.
#[tracing::instrument(skip(now, tz), fields(input = input))]
pub fn parse_datetime_expr(
  input: &str,
  now: DateTime<Utc>,
  tz: Tz
) -> anyhow::Result<DateTime<Utc>> {
  let token = input.trim();

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Ok(dt.with_timezone(&Utc));
  }

  for fmt in
    ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
  {
    if let Ok(ndt) =
      NaiveDateTime::parse_from_str(
        token, fmt
      )
    {
      return to_utc_from_local(
        ndt, tz, fmt
      );
    }
  }

  let rel_re = Regex::new(r"^\+(?P<num>\d+)(?P<unit>[hm])$")
    .map_err(|e| anyhow!("internal regex compile failure: {e}"))?;
  if let Some(caps) =
    rel_re.captures(token)
  {
    let num: i64 = caps
      .name("num")
      .map(|m| m.as_str())
      .unwrap_or("0")
      .parse()
      .context(
        "invalid relative number"
      )?;
    let duration = match caps
      .name("unit")
      .map(|m| m.as_str())
    {
      | Some("h") => {
        Duration::try_hours(num)
      }
      | _ => Duration::try_minutes(num)
    };
    return duration
      .and_then(|delta| {
        now.checked_add_signed(delta)
      })
      .ok_or_else(|| {
        anyhow!(
          "relative time out of range"
        )
      });
  }

  if let Some((hour, minute)) =
    parse_clock_time(token)
  {
    let local_now = now.with_timezone(&tz);
    let mut day = local_now.date_naive();
    let candidate = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct clock \
           time candidate"
        )
      })?;
    if candidate
      <= local_now.naive_local()
    {
      day = add_days(day, 1);
    }
    let next = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct next \
           clock time candidate"
        )
      })?;
    return to_utc_from_local(
      next,
      tz,
      "clock-time"
    );
  }

  Err(anyhow!(
    "unrecognized reminder time: \
     {input}"
  ))
  .with_context(|| {
    "supported formats: RFC3339, \
     YYYY-MM-DD HH:MM, HH:MM, +Nh, +Nm"
  })
}

fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token.trim() {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "tuesday" | "tue" | "tues" => {
      Some(Weekday::Tue)
    }
    | "wednesday" | "wed" => {
      Some(Weekday::Wed)
    }
    | "thursday" | "thu" | "thur"
    | "thurs" => Some(Weekday::Thu),
    | "friday" | "fri" => {
      Some(Weekday::Fri)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | _ => None
  }
}

fn next_weekday_date(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let from_idx = i64::from(
    from.weekday().num_days_from_monday()
  );
  let target_idx = i64::from(
    target.num_days_from_monday()
  );
  let mut delta =
    (7 + target_idx - from_idx) % 7;
  if delta == 0 {
    delta = 7;
  }
  add_days(from, delta)
}

fn parse_clock_time(
  token: &str
) -> Option<(u32, u32)> {
  let (hour, minute) =
    token.trim().split_once(':')?;
  if hour.is_empty()
    || hour.len() > 2
    || minute.len() != 2
  {
    return None;
  }
  let hour = hour.parse::<u32>().ok()?;
  let minute =
    minute.parse::<u32>().ok()?;
  if hour > 23 || minute > 59 {
    return None;
  }
  Some((hour, minute))
}

/// ISO-8601 instants as written by browsers (`2026-10-18T09:30:00.000Z`).
///
/// Reading also accepts a zone-less `YYYY-MM-DDTHH:MM[:SS]`, taken as
/// UTC.
pub mod iso_datetime {
  use chrono::{
    DateTime,
    NaiveDateTime,
    SecondsFormat,
    Utc
  };
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  pub fn serialize<S>(
    dt: &DateTime<Utc>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    serializer.serialize_str(
      &dt.to_rfc3339_opts(
        SecondsFormat::Millis,
        true
      )
    )
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<DateTime<Utc>, D::Error>
  where
    D: Deserializer<'de>
  {
    let raw = String::deserialize(
      deserializer
    )?;
    parse(&raw)
      .map_err(serde::de::Error::custom)
  }

  pub fn parse(
    raw: &str
  ) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(dt) =
      DateTime::parse_from_rfc3339(raw)
    {
      return Ok(dt.with_timezone(&Utc));
    }
    for fmt in [
      "%Y-%m-%dT%H:%M:%S%.f",
      "%Y-%m-%dT%H:%M"
    ] {
      if let Ok(ndt) =
        NaiveDateTime::parse_from_str(
          raw, fmt
        )
      {
        return Ok(ndt.and_utc());
      }
    }
    Err(format!(
      "invalid ISO datetime: {raw}"
    ))
  }

  pub mod option {
    use chrono::{
      DateTime,
      Utc
    };
    use serde::{
      Deserialize,
      Deserializer,
      Serializer
    };

    pub fn serialize<S>(
      dt: &Option<DateTime<Utc>>,
      serializer: S
    ) -> Result<S::Ok, S::Error>
    where
      S: Serializer
    {
      match dt {
        | Some(value) => {
          super::serialize(
            value, serializer
          )
        }
        | None => {
          serializer.serialize_none()
        }
      }
    }

    pub fn deserialize<'de, D>(
      deserializer: D
    ) -> Result<
      Option<DateTime<Utc>>,
      D::Error
    >
    where
      D: Deserializer<'de>
    {
      let opt =
        Option::<String>::deserialize(
          deserializer
        )?;
      match opt {
        | Some(raw) if raw.trim().is_empty() => Ok(None),
        | Some(raw) => super::parse(&raw)
          .map(Some)
          .map_err(serde::de::Error::custom),
        | None => Ok(None)
      }
    }
  }
}

/// Calendar dates stored as `YYYY-MM-DD`. A full ISO timestamp is
/// accepted on read and truncated to its date part.
pub mod iso_date {
  pub mod option {
    use chrono::NaiveDate;
    use serde::{
      Deserialize,
      Deserializer,
      Serializer
    };

    pub fn serialize<S>(
      date: &Option<NaiveDate>,
      serializer: S
    ) -> Result<S::Ok, S::Error>
    where
      S: Serializer
    {
      match date {
        | Some(value) => {
          serializer.serialize_str(
            &value
              .format("%Y-%m-%d")
              .to_string()
          )
        }
        | None => {
          serializer.serialize_none()
        }
      }
    }

    pub fn deserialize<'de, D>(
      deserializer: D
    ) -> Result<Option<NaiveDate>, D::Error>
    where
      D: Deserializer<'de>
    {
      let opt =
        Option::<String>::deserialize(
          deserializer
        )?;
      let Some(raw) = opt else {
        return Ok(None);
      };
      let raw = raw.trim();
      if raw.is_empty() {
        return Ok(None);
      }
      let date_part =
        raw.get(..10).unwrap_or(raw);
      NaiveDate::parse_from_str(
        date_part, "%Y-%m-%d"
      )
      .map(Some)
      .map_err(serde::de::Error::custom)
    }
  }
}
