//! Bounded priority queue of job ids.
//!
//! Ordering is priority tier first, then submission sequence. Jobs re-entering
//! after a failed attempt carry a not-before instant and keep their original
//! sequence, so a retry goes back to its old place in line once its backoff
//! has elapsed.

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;

use crate::error::{Result, RunlaneError};
use crate::state_machine::Priority;

type Rank = (Priority, u64);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    job_id: String,
    ready_at: Option<Instant>,
}

#[derive(Debug)]
pub struct JobQueue {
    max_depth: usize,
    entries: BTreeMap<Rank, Entry>,
    index: HashMap<String, Rank>,
}

impl JobQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            entries: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.index.contains_key(job_id)
    }

    /// Accept a new job. Returns its 1-based position, or `QueueFull`.
    pub fn enqueue(&mut self, job_id: &str, priority: Priority, sequence: u64) -> Result<usize> {
        if self.entries.len() >= self.max_depth {
            return Err(RunlaneError::QueueFull {
                max_depth: self.max_depth,
            });
        }
        self.insert(job_id, priority, sequence, None);
        Ok(self.position(job_id).unwrap_or(self.entries.len()))
    }

    /// Put an already-accepted job back for another attempt. Never rejected.
    pub fn requeue(&mut self, job_id: &str, priority: Priority, sequence: u64, ready_at: Instant) {
        self.insert(job_id, priority, sequence, Some(ready_at));
    }

    fn insert(
        &mut self,
        job_id: &str,
        priority: Priority,
        sequence: u64,
        ready_at: Option<Instant>,
    ) {
        let rank = (priority, sequence);
        if let Some(old) = self.index.insert(job_id.to_string(), rank) {
            self.entries.remove(&old);
        }
        self.entries.insert(
            rank,
            Entry {
                job_id: job_id.to_string(),
                ready_at,
            },
        );
    }

    /// Best-ranked job id that is ready at `now`, without removing it.
    pub fn peek_next(&self, now: Instant) -> Option<&str> {
        self.entries
            .values()
            .find(|e| e.ready_at.is_none_or(|at| at <= now))
            .map(|e| e.job_id.as_str())
    }

    /// Remove and return the best-ranked ready job id.
    pub fn pop_next(&mut self, now: Instant) -> Option<String> {
        let rank = self
            .entries
            .iter()
            .find(|(_, e)| e.ready_at.is_none_or(|at| at <= now))
            .map(|(rank, _)| *rank)?;
        let entry = self.entries.remove(&rank)?;
        self.index.remove(&entry.job_id);
        Some(entry.job_id)
    }

    /// Earliest not-before instant among waiting retries.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.ready_at).min()
    }

    pub fn remove(&mut self, job_id: &str) -> Result<()> {
        let rank = self
            .index
            .remove(job_id)
            .ok_or_else(|| RunlaneError::JobNotFound(job_id.to_string()))?;
        self.entries.remove(&rank);
        Ok(())
    }

    /// 1-based position in dequeue order.
    pub fn position(&self, job_id: &str) -> Option<usize> {
        let rank = self.index.get(job_id)?;
        Some(self.entries.range(..*rank).count() + 1)
    }

    /// Not-before instant of a waiting retry.
    pub fn ready_at(&self, job_id: &str) -> Option<Instant> {
        let rank = self.index.get(job_id)?;
        self.entries.get(rank)?.ready_at
    }

    /// Job ids in dequeue order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.values().map(|e| e.job_id.clone()).collect()
    }
}
