//! Cron schedule manager
//!
//! Hooks bind to crontabs in the 5-field form (`*/5 * * * *`) or the 6-field
//! form with leading seconds. Each distinct crontab is registered once and
//! reference counted across hooks; when it fires, the crontab string is sent
//! on the event channel.

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{KubeError, Result};

/// Granularity of schedule checks
const TICK: Duration = Duration::from_secs(1);

/// Parse a hook crontab, adding the seconds field when absent
pub fn parse_crontab(crontab: &str) -> Result<Schedule> {
    let fields = crontab.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", crontab.trim()),
        6 | 7 => crontab.trim().to_string(),
        _ => {
            return Err(KubeError::InvalidCrontab {
                crontab: crontab.to_string(),
                message: format!("expected 5 or 6 fields, found {}", fields),
            });
        }
    };

    Schedule::from_str(&normalized).map_err(|e| KubeError::InvalidCrontab {
        crontab: crontab.to_string(),
        message: e.to_string(),
    })
}

struct Entry {
    schedule: Schedule,
    refs: usize,
}

/// Emits registered crontabs when they are due
pub struct ScheduleManager {
    entries: Mutex<HashMap<String, Entry>>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    cancel: CancellationToken,
}

impl ScheduleManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            entries: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a crontab (or add a reference to it)
    pub fn add(&self, crontab: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(crontab) {
            entry.refs += 1;
            return Ok(());
        }

        let schedule = parse_crontab(crontab)?;
        entries.insert(crontab.to_string(), Entry { schedule, refs: 1 });
        tracing::debug!(crontab = %crontab, "crontab added");
        Ok(())
    }

    /// Drop a reference; the crontab stops firing with its last reference
    pub fn remove(&self, crontab: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(crontab) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(crontab);
                tracing::debug!(crontab = %crontab, "crontab removed");
            }
        }
    }

    pub fn contains(&self, crontab: &str) -> bool {
        self.entries.lock().contains_key(crontab)
    }

    /// Take the event stream; only the first call gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.rx.lock().take()
    }

    /// Crontabs with a firing time in `(last, now]`
    pub fn due(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| {
                entry
                    .schedule
                    .after(&last)
                    .next()
                    .is_some_and(|next| next <= now)
            })
            .map(|(crontab, _)| crontab.clone())
            .collect();
        due.sort();
        due
    }

    /// Start ticking in the background
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut last = Utc::now();
            let mut ticker = tokio::time::interval(TICK);

            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = Utc::now();
                for crontab in manager.due(last, now) {
                    tracing::debug!(crontab = %crontab, "crontab fired");
                    let _ = manager.tx.send(crontab);
                }
                last = now;
            }

            tracing::info!("schedule manager stopped");
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Default for ScheduleManager {
    fn default() -> Self {
        Self::new()
    }
}
