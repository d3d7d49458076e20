//! Recurring wake triggers, one per enabled job.
//!
//! Every trigger is a tokio task that sleeps until its first fire and then
//! ticks once per period, sending a [`WakeEvent`] to the supervisor. The
//! trigger table is the only state; it is keyed by the deterministic
//! trigger name `job-<id>`.

use crate::scheduler::clock::Clock;
use crate::scheduler::job::{Job, Schedule};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const TRIGGER_PREFIX: &str = "job-";

/// Emitted each time a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEvent {
    pub job_id: String,
    /// Name of the trigger that fired.
    pub trigger: String,
}

/// Public view of an installed trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    pub name: String,
    pub job_id: String,
    pub schedule: Schedule,
    pub first_fire_at: DateTime<Utc>,
    pub period: chrono::Duration,
}

struct TriggerEntry {
    info: TriggerInfo,
    task: JoinHandle<()>,
}

/// Owns the table of live wake triggers.
pub struct WakeScheduler {
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<WakeEvent>,
    triggers: Mutex<HashMap<String, TriggerEntry>>,
}

impl std::fmt::Debug for WakeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeScheduler")
            .field("triggers", &self.names())
            .finish()
    }
}

/// Trigger name for a job id.
#[must_use]
pub fn trigger_name(job_id: &str) -> String {
    format!("{TRIGGER_PREFIX}{job_id}")
}

impl WakeScheduler {
    /// Create an empty scheduler and the receiver its triggers fire into.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<WakeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            clock,
            events,
            triggers: Mutex::new(HashMap::new()),
        };
        (scheduler, rx)
    }

    /// Create a trigger for every enabled job that has none.
    ///
    /// Existing triggers are left untouched. Returns the number created.
    pub fn reconcile(&self, jobs: &[Job]) -> usize {
        let created = jobs.iter().filter(|job| self.ensure(job)).count();
        if created > 0 {
            info!(created, total = self.len(), "wake triggers reconciled");
        }
        created
    }

    /// Create the trigger for `job` if it is enabled and has none.
    ///
    /// Returns `true` when a trigger was created.
    pub fn ensure(&self, job: &Job) -> bool {
        if !job.enabled {
            return false;
        }
        if let Err(e) = job.schedule.validate() {
            warn!(job_id = %job.id, error = %e, "not scheduling job with invalid schedule");
            return false;
        }

        let name = trigger_name(&job.id);
        let mut triggers = self.lock();
        if triggers.contains_key(&name) {
            return false;
        }

        let now = self.clock.now();
        let first_delay = job.schedule.next_fire_after(self.clock.local_now());
        let period = job.schedule.period();
        let Some(first_fire_at) = now.checked_add_signed(first_delay) else {
            warn!(
                job_id = %job.id,
                schedule = %job.schedule,
                "first fire is out of range; not scheduling"
            );
            return false;
        };
        let info = TriggerInfo {
            name: name.clone(),
            job_id: job.id.clone(),
            schedule: job.schedule,
            first_fire_at,
            period,
        };
        let task = tokio::spawn(fire_loop(
            job.id.clone(),
            name.clone(),
            to_std(first_delay),
            to_std(period),
            self.events.clone(),
        ));
        debug!(
            job_id = %job.id,
            schedule = %job.schedule,
            first_fire_at = %info.first_fire_at,
            "wake trigger created"
        );
        triggers.insert(name, TriggerEntry { info, task });
        true
    }

    /// Remove the trigger for `job_id`. Returns `true` if one existed.
    pub fn clear(&self, job_id: &str) -> bool {
        let removed = self.lock().remove(&trigger_name(job_id));
        match removed {
            Some(entry) => {
                entry.task.abort();
                debug!(job_id, "wake trigger cleared");
                true
            }
            None => false,
        }
    }

    /// Remove triggers whose job is gone, disabled or rescheduled.
    ///
    /// Returns the number of triggers removed.
    pub fn prune(&self, jobs: &[Job]) -> usize {
        let by_id: HashMap<&str, &Job> = jobs.iter().map(|job| (job.id.as_str(), job)).collect();
        let mut triggers = self.lock();
        let before = triggers.len();
        triggers.retain(|_, entry| {
            let keep = by_id
                .get(entry.info.job_id.as_str())
                .is_some_and(|job| job.enabled && job.schedule == entry.info.schedule);
            if !keep {
                entry.task.abort();
                debug!(job_id = %entry.info.job_id, "stale wake trigger pruned");
            }
            keep
        });
        before - triggers.len()
    }

    /// Remove every trigger.
    pub fn clear_all(&self) {
        for (_, entry) in self.lock().drain() {
            entry.task.abort();
        }
    }

    /// Sorted trigger names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Trigger details for `job_id`.
    #[must_use]
    pub fn get(&self, job_id: &str) -> Option<TriggerInfo> {
        self.lock()
            .get(&trigger_name(job_id))
            .map(|entry| entry.info.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TriggerEntry>> {
        match self.triggers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for WakeScheduler {
    fn drop(&mut self) {
        self.clear_all();
    }
}

async fn fire_loop(
    job_id: String,
    trigger: String,
    first_delay: Duration,
    period: Duration,
    events: mpsc::UnboundedSender<WakeEvent>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let event = WakeEvent {
            job_id: job_id.clone(),
            trigger: trigger.clone(),
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

fn to_std(delay: chrono::Duration) -> Duration {
    delay.to_std().unwrap_or(Duration::ZERO).max(Duration::from_millis(1))
}
