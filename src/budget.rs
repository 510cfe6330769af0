//! Per-job and per-day cost accounting.
//!
//! [`CostTracker`] owns the budget ledger. It is the only component that reads
//! or writes cumulative cost, and it answers one question for the retry
//! engine: is another attempt affordable? Totals only ever grow within their
//! window; the daily window rolls over at UTC midnight.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

fn default_alert_threshold() -> f64 {
    0.8
}

/// Spending limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    #[serde(default)]
    pub per_task_limit: Option<f64>,
    #[serde(default)]
    pub daily_limit: Option<f64>,
    /// Fraction of the daily limit at which a warning is emitted.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            per_task_limit: None,
            daily_limit: None,
            alert_threshold: default_alert_threshold(),
        }
    }
}

/// One line of the JSONL ledger file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub cost: f64,
    pub job_total: f64,
    pub daily_total: f64,
}

/// Raised once per day when spend crosses the alert threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetAlert {
    pub daily_total: f64,
    pub daily_limit: f64,
    pub threshold: f64,
}

#[derive(Debug)]
pub struct CostTracker {
    per_job: HashMap<String, f64>,
    day: NaiveDate,
    daily_total: f64,
    alerted_on: Option<NaiveDate>,
    limits: BudgetLimits,
    ledger_path: Option<PathBuf>,
}

impl CostTracker {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            per_job: HashMap::new(),
            day: Utc::now().date_naive(),
            daily_total: 0.0,
            alerted_on: None,
            limits,
            ledger_path: None,
        }
    }

    /// Create a tracker backed by a JSONL ledger, recovering today's total
    /// from existing entries.
    pub fn with_ledger(limits: BudgetLimits, path: &Path) -> Result<Self> {
        let mut tracker = Self::new(limits);
        tracker.ledger_path = Some(path.to_path_buf());

        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let today = tracker.day;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<LedgerEntry>(line) {
                    Ok(entry) if entry.timestamp.date_naive() == today => {
                        tracker.daily_total += entry.cost.max(0.0);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping bad ledger line"),
                }
            }
        }
        Ok(tracker)
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    pub fn record_attempt(&mut self, job_id: &str, cost: f64) -> Option<BudgetAlert> {
        self.record_at(job_id, cost, Utc::now())
    }

    pub fn record_at(
        &mut self,
        job_id: &str,
        cost: f64,
        now: DateTime<Utc>,
    ) -> Option<BudgetAlert> {
        self.roll(now.date_naive());
        if !cost.is_finite() || cost <= 0.0 {
            return None;
        }

        let job_total = {
            let total = self.per_job.entry(job_id.to_string()).or_insert(0.0);
            *total += cost;
            *total
        };
        self.daily_total += cost;

        if let Some(path) = &self.ledger_path {
            let entry = LedgerEntry {
                timestamp: now,
                job_id: job_id.to_string(),
                cost,
                job_total,
                daily_total: self.daily_total,
            };
            if let Err(e) = append_entry(path, &entry) {
                warn!(path = %path.display(), error = %e, "failed to append budget ledger entry");
            }
        }

        self.check_alert()
    }

    fn check_alert(&mut self) -> Option<BudgetAlert> {
        let limit = self.limits.daily_limit.filter(|l| *l > 0.0)?;
        if self.alerted_on == Some(self.day) {
            return None;
        }
        if self.daily_total < limit * self.limits.alert_threshold {
            return None;
        }
        self.alerted_on = Some(self.day);
        warn!(
            daily_total = self.daily_total,
            daily_limit = limit,
            threshold = self.limits.alert_threshold,
            "daily test budget alert threshold crossed"
        );
        Some(BudgetAlert {
            daily_total: self.daily_total,
            daily_limit: limit,
            threshold: self.limits.alert_threshold,
        })
    }

    /// Whether another attempt for `job_id` stays within both limits.
    pub fn can_retry(
        &self,
        job_id: &str,
        per_task_limit: Option<f64>,
        daily_limit: Option<f64>,
    ) -> bool {
        self.can_retry_at(job_id, per_task_limit, daily_limit, Utc::now())
    }

    pub fn can_retry_at(
        &self,
        job_id: &str,
        per_task_limit: Option<f64>,
        daily_limit: Option<f64>,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(limit) = per_task_limit {
            if self.job_cost(job_id) >= limit {
                return false;
            }
        }
        if let Some(limit) = daily_limit {
            if self.daily_total_at(now) >= limit {
                return false;
            }
        }
        true
    }

    pub fn job_cost(&self, job_id: &str) -> f64 {
        self.per_job.get(job_id).copied().unwrap_or(0.0)
    }

    pub fn daily_total(&self) -> f64 {
        self.daily_total_at(Utc::now())
    }

    pub fn daily_total_at(&self, now: DateTime<Utc>) -> f64 {
        if now.date_naive() == self.day {
            self.daily_total
        } else {
            0.0
        }
    }

    /// Drop a purged job's per-job total. The daily total is unaffected.
    pub fn forget(&mut self, job_id: &str) {
        self.per_job.remove(job_id);
    }

    fn roll(&mut self, today: NaiveDate) {
        if today > self.day {
            self.day = today;
            self.daily_total = 0.0;
        }
    }
}

fn append_entry(path: &Path, entry: &LedgerEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")
}
