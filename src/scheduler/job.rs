//! Job definitions and schedule arithmetic.
//!
//! Defines the [`Job`] type, the tagged [`Schedule`] enum and the pure
//! functions the wake scheduler and recovery use to decide when a job
//! fires next or whether a fire was missed.

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A wall-clock time of day (`HH:MM`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    /// Build a time of day, validating the ranges.
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "time of day out of range: {hour:02}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Hour of day (0-23).
    #[must_use]
    pub fn hour(self) -> u8 {
        self.hour
    }

    /// Minute of hour (0-59).
    #[must_use]
    pub fn minute(self) -> u8 {
        self.minute
    }

    /// This time on the calendar day of `now`, in `now`'s offset.
    fn on_day_of(self, now: &DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let naive = now
            .date_naive()
            .and_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)?;
        now.offset().from_local_datetime(&naive).single()
    }
}

impl FromStr for TimeOfDay {
    type Err = SchedulerError;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (hour, minute) = trimmed.split_once(':').ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("expected HH:MM, got {trimmed:?}"))
        })?;
        let hour: u8 = hour.parse().map_err(|_| {
            SchedulerError::InvalidSchedule(format!("invalid hour in {trimmed:?}"))
        })?;
        let minute: u8 = minute.parse().map_err(|_| {
            SchedulerError::InvalidSchedule(format!("invalid minute in {trimmed:?}"))
        })?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = SchedulerError;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(time: TimeOfDay) -> Self {
        time.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// When a job should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Once a day at a local time of day.
    Daily {
        /// Local time of day.
        time: TimeOfDay,
    },
    /// Every N hours.
    Hourly {
        /// Interval in hours (positive).
        every: u32,
    },
    /// Every N minutes.
    Minutely {
        /// Interval in minutes (positive).
        every: u32,
    },
}

/// Longest accepted interval for hourly schedules (one year).
pub const MAX_INTERVAL_HOURS: u32 = 24 * 365;

/// Longest accepted interval for minutely schedules (one year).
pub const MAX_INTERVAL_MINUTES: u32 = 60 * MAX_INTERVAL_HOURS;

impl Schedule {
    /// Reject zero intervals and intervals longer than a year.
    pub fn validate(&self) -> Result<()> {
        let (every, max, unit) = match self {
            Self::Daily { .. } => return Ok(()),
            Self::Hourly { every } => (*every, MAX_INTERVAL_HOURS, "hours"),
            Self::Minutely { every } => (*every, MAX_INTERVAL_MINUTES, "minutes"),
        };
        if every == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "interval must be a positive integer".to_owned(),
            ));
        }
        if every > max {
            return Err(SchedulerError::InvalidSchedule(format!(
                "interval of {every} {unit} exceeds the maximum of {max}"
            )));
        }
        Ok(())
    }

    /// Repeat period of the wake trigger.
    #[must_use]
    pub fn period(&self) -> Duration {
        match self {
            Self::Daily { .. } => Duration::hours(24),
            Self::Hourly { every } => Duration::hours(i64::from(*every)),
            Self::Minutely { every } => Duration::minutes(i64::from(*every)),
        }
    }

    /// Delay from `now` until the first fire of a freshly created trigger.
    ///
    /// Daily schedules fire at the next occurrence of their time; when that
    /// time today is not strictly in the future the fire moves to tomorrow.
    /// Interval schedules fire one period from now.
    #[must_use]
    pub fn next_fire_after(&self, now: DateTime<FixedOffset>) -> Duration {
        match self {
            Self::Daily { time } => {
                let Some(today) = time.on_day_of(&now) else {
                    return Duration::hours(24);
                };
                let next = if today <= now {
                    today + Duration::days(1)
                } else {
                    today
                };
                next - now
            }
            Self::Hourly { .. } | Self::Minutely { .. } => self.period(),
        }
    }

    /// Wire name of the schedule kind.
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Daily { .. } => "daily",
            Self::Hourly { .. } => "hourly",
            Self::Minutely { .. } => "minutely",
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily { time } => write!(f, "daily at {time}"),
            Self::Hourly { every: 1 } => write!(f, "every hour"),
            Self::Hourly { every } => write!(f, "every {every} hours"),
            Self::Minutely { every: 1 } => write!(f, "every minute"),
            Self::Minutely { every } => write!(f, "every {every} minutes"),
        }
    }
}

/// A scheduled task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable identifier, also the remote row key.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Opaque payload handed to the task executor.
    pub query: String,
    /// When the job fires.
    pub schedule: Schedule,
    /// Whether the job has an active wake trigger.
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    /// Sync conflict key.
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new enabled job with a fresh id.
    pub fn new(
        name: impl Into<String>,
        query: impl Into<String>,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            query: query.into(),
            schedule,
            enabled: true,
            created_at: now,
            updated_at: now,
            last_run_at: None,
        }
    }

    /// Returns `true` when the fields that sync compares are equal.
    ///
    /// Identity and bookkeeping fields (`id`, `created_at`, `updated_at`,
    /// `last_run_at`) are ignored.
    #[must_use]
    pub fn same_definition(&self, other: &Job) -> bool {
        self.name == other.name
            && self.query == other.query
            && self.schedule == other.schedule
            && self.enabled == other.enabled
    }

    /// Whether a fire should have happened while the process was down.
    ///
    /// Daily: today's scheduled time has passed. Interval: more than one
    /// period has elapsed since the job was created.
    #[must_use]
    pub fn missed_fire(&self, now: DateTime<FixedOffset>) -> bool {
        match self.schedule {
            Schedule::Daily { time } => match time.on_day_of(&now) {
                Some(today) => today <= now,
                None => false,
            },
            Schedule::Hourly { .. } | Schedule::Minutely { .. } => {
                now.with_timezone(&Utc) - self.created_at > self.schedule.period()
            }
        }
    }
}
