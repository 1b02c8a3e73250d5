use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule::{compute_next_run, is_due},
    types::{Schedule, Trigger, TriggerState, TriggerTable},
};

/// A trigger that came due, as sent to the dispatcher.
#[derive(Debug, Clone)]
pub struct FiredTrigger {
    pub trigger: Trigger,
    pub fired_at: DateTime<Utc>,
}

/// Read-only view of trigger state for the status endpoint.
///
/// Uses its own `Connection` so status requests never contend with the
/// engine's tick.
#[derive(Clone)]
pub struct SchedulerHandle {
    conn: Arc<Mutex<Connection>>,
}

impl SchedulerHandle {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn list_triggers(&self) -> Result<Vec<TriggerState>> {
        let conn = self.conn.lock().map_err(|_| SchedulerError::Poisoned)?;
        load_triggers(&conn)
    }
}

/// Core scheduler: keeps trigger state in SQLite and fires at ±1 s precision.
pub struct SchedulerEngine {
    conn: Connection,
    /// If set, fired triggers are sent here for dispatch.
    fired_tx: Option<mpsc::Sender<FiredTrigger>>,
}

impl SchedulerEngine {
    /// Create a new engine, initialising the DB schema if needed.
    ///
    /// The sender is non-blocking (`try_send`) so the tick loop is never stalled.
    pub fn new(conn: Connection, fired_tx: Option<mpsc::Sender<FiredTrigger>>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { conn, fired_tx })
    }

    pub fn reconcile(&mut self, table: &TriggerTable) -> Result<()> {
        self.reconcile_at(table, Utc::now())
    }

    /// Make the persisted triggers match `table`. New names are armed at
    /// `now`, removed names are deleted, and `last_fired` of surviving names
    /// is kept.
    pub fn reconcile_at(&mut self, table: &TriggerTable, now: DateTime<Utc>) -> Result<()> {
        let now_str = fmt_ts(now);
        let tx = self.conn.transaction()?;
        let existing = load_triggers(&tx)?;

        for trigger in table.triggers() {
            let schedule_json = serde_json::to_string(&trigger.schedule)
                .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
            let baseline = existing
                .iter()
                .find(|s| s.trigger.name == trigger.name)
                .map(|s| s.baseline())
                .unwrap_or(now);
            let next = compute_next_run(&trigger.schedule, baseline).map(fmt_ts);

            tx.execute(
                "INSERT INTO sync_triggers
                 (name, sync_type, schedule, run_limit, skip_existing,
                  armed_at, last_fired, next_run, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?6)
                 ON CONFLICT(name) DO UPDATE SET
                    sync_type     = excluded.sync_type,
                    schedule      = excluded.schedule,
                    run_limit     = excluded.run_limit,
                    skip_existing = excluded.skip_existing,
                    next_run      = excluded.next_run,
                    updated_at    = excluded.updated_at",
                rusqlite::params![
                    trigger.name,
                    trigger.sync_type.as_str(),
                    schedule_json,
                    trigger.limit,
                    trigger.skip_existing,
                    now_str,
                    next,
                ],
            )?;
        }

        let wanted: HashSet<&str> = table.triggers().iter().map(|t| t.name.as_str()).collect();
        for stale in existing.iter().filter(|s| !wanted.contains(s.trigger.name.as_str())) {
            tx.execute(
                "DELETE FROM sync_triggers WHERE name = ?1",
                [&stale.trigger.name],
            )?;
            info!(trigger = %stale.trigger.name, "trigger removed from schedule");
        }
        tx.commit()?;

        info!(count = table.len(), "trigger table reconciled");
        Ok(())
    }

    pub fn list_triggers(&self) -> Result<Vec<TriggerState>> {
        load_triggers(&self.conn)
    }

    /// Main event loop. Ticks every second until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick_at(Utc::now()) {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fire every trigger that is due at `now` and return what was forwarded.
    ///
    /// Several due triggers of the same sync type (e.g. two missed full
    /// windows) are all marked fired but only the first is forwarded.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Result<Vec<FiredTrigger>> {
        let now_str = fmt_ts(now);
        let due: Vec<TriggerState> = load_triggers(&self.conn)?
            .into_iter()
            .filter(|s| is_due(&s.trigger.schedule, s.baseline(), now))
            .collect();

        let mut fired = Vec::new();
        let mut seen_types = HashSet::new();
        for state in due {
            let baseline = state.baseline();
            let trigger = state.trigger;
            let next = compute_next_run(&trigger.schedule, now).map(fmt_ts);
            self.conn.execute(
                "UPDATE sync_triggers SET last_fired = ?1, next_run = ?2, updated_at = ?1
                 WHERE name = ?3",
                rusqlite::params![now_str, next, trigger.name],
            )?;

            if !seen_types.insert(trigger.sync_type) {
                debug!(trigger = %trigger.name, "coalesced with an earlier trigger of the same type");
                continue;
            }
            let window = compute_next_run(&trigger.schedule, baseline).unwrap_or(now);
            if now - window > chrono::Duration::minutes(1) {
                warn!(trigger = %trigger.name, %window, "catching up a missed window");
            }
            info!(trigger = %trigger.name, sync_type = %trigger.sync_type, "trigger fired");

            let event = FiredTrigger {
                trigger,
                fired_at: now,
            };
            // try_send never blocks the tick loop; log a warning if the channel is full.
            if let Some(ref tx) = self.fired_tx {
                if tx.try_send(event.clone()).is_err() {
                    warn!(trigger = %event.trigger.name, "dispatch channel full or closed, trigger dropped");
                }
            }
            fired.push(event);
        }
        Ok(fired)
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })
    })
    .transpose()
}

fn load_triggers(conn: &Connection) -> Result<Vec<TriggerState>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, sync_type, schedule, run_limit, skip_existing,
                armed_at, last_fired, next_run
         FROM sync_triggers ORDER BY name",
    )?;
    let rows = stmt
        .query_map([], raw_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut states = Vec::with_capacity(rows.len());
    for (raw, armed_at, last_fired, next_run) in rows {
        let schedule: Schedule = match serde_json::from_str(&raw.schedule) {
            Ok(s) => s,
            Err(e) => {
                error!(trigger = %raw.name, "bad schedule JSON: {e}");
                continue;
            }
        };
        states.push(TriggerState {
            trigger: Trigger {
                name: raw.name,
                sync_type: raw.sync_type.parse()?,
                schedule,
                limit: raw.limit,
                skip_existing: raw.skip_existing,
            },
            armed_at,
            last_fired,
            next_run,
        });
    }
    Ok(states)
}

struct RawTrigger {
    name: String,
    sync_type: String,
    schedule: String,
    limit: u32,
    skip_existing: bool,
}

type RawRow = (
    RawTrigger,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    let armed_at = parse_ts(5, Some(row.get(5)?))?.unwrap_or_else(Utc::now);
    Ok((
        RawTrigger {
            name: row.get(0)?,
            sync_type: row.get(1)?,
            schedule: row.get(2)?,
            limit: row.get(3)?,
            skip_existing: row.get(4)?,
        },
        armed_at,
        parse_ts(6, row.get(6)?)?,
        parse_ts(7, row.get(7)?)?,
    ))
}
