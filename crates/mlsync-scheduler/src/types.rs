use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mlsync_core::config::ScheduleConfig;
use mlsync_core::SyncType;

use crate::error::{Result, SchedulerError};

/// Defines when a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Fire every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },
}

impl Schedule {
    /// Parse a `"HH:MM"` UTC time of day.
    pub fn daily_at(hhmm: &str) -> Result<Self> {
        let invalid = || SchedulerError::InvalidSchedule(format!("expected HH:MM, got {hhmm:?}"));
        let (h, m) = hhmm.trim().split_once(':').ok_or_else(invalid)?;
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok(Schedule::Daily { hour, minute })
    }

    pub fn every_minutes(mins: u64) -> Result<Self> {
        if mins == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "interval must be at least one minute".to_string(),
            ));
        }
        Ok(Schedule::Interval {
            every_secs: mins * 60,
        })
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Interval { every_secs } if every_secs % 60 == 0 => {
                write!(f, "every {}m", every_secs / 60)
            }
            Schedule::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Schedule::Daily { hour, minute } => write!(f, "daily {hour:02}:{minute:02}"),
        }
    }
}

/// One configured schedule entry: what to run and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Unique, derived from the sync type and time (e.g. `full@01:00`).
    pub name: String,
    pub sync_type: SyncType,
    pub schedule: Schedule,
    pub limit: u32,
    pub skip_existing: bool,
}

/// A trigger together with its persisted firing state.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerState {
    #[serde(flatten)]
    pub trigger: Trigger,
    pub armed_at: DateTime<Utc>,
    pub last_fired: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl TriggerState {
    /// Reference instant for deciding whether the trigger is due.
    pub fn baseline(&self) -> DateTime<Utc> {
        self.last_fired.unwrap_or(self.armed_at)
    }
}

/// The configured set of triggers.
#[derive(Debug, Clone, Default)]
pub struct TriggerTable {
    triggers: Vec<Trigger>,
}

impl TriggerTable {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }

    /// Full windows, the incremental interval and the daily image refresh.
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let mut triggers = Vec::with_capacity(config.full_windows.len() + 2);

        for window in &config.full_windows {
            let schedule = Schedule::daily_at(window)?;
            let name = format!("{}@{}", SyncType::Full, window.trim());
            if triggers.iter().any(|t: &Trigger| t.name == name) {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "duplicate full window {window}"
                )));
            }
            triggers.push(Trigger {
                name,
                sync_type: SyncType::Full,
                schedule,
                limit: config.full_limit,
                skip_existing: false,
            });
        }

        triggers.push(Trigger {
            name: SyncType::Incremental.to_string(),
            sync_type: SyncType::Incremental,
            schedule: Schedule::every_minutes(config.incremental_every_mins)?,
            limit: config.incremental_limit,
            skip_existing: false,
        });

        triggers.push(Trigger {
            name: format!("{}@{}", SyncType::ImageRefresh, config.image_refresh_at.trim()),
            sync_type: SyncType::ImageRefresh,
            schedule: Schedule::daily_at(&config.image_refresh_at)?,
            limit: config.image_limit,
            skip_existing: config.image_skip_existing,
        });

        Ok(Self { triggers })
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
