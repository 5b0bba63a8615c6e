//! Tiered retry schedule keyed by per-job failure count.
//!
//! A failed job is released back to the broker with a delay that grows with
//! the number of failures seen on the worker's connection. Once the count
//! passes the last tier the job is discarded (acknowledged, never released).

use crate::error::QueueError;
use crate::job::JobId;
use std::collections::HashMap;
use std::time::Duration;

/// What to do with a job after a failed dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Put the job back, visible again after the delay
    Release(Duration),
    /// Give up; the job is acknowledged so the broker deletes it
    Discard,
}

/// One `(max_attempt inclusive, delay)` tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTier {
    pub max_attempt: u32,
    pub delay: Duration,
}

impl RetryTier {
    pub const fn new(max_attempt: u32, delay: Duration) -> Self {
        Self { max_attempt, delay }
    }
}

/// Immutable retry tier table.
///
/// Tiers are ordered by strictly increasing `max_attempt`; any attempt past
/// the last tier is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTiers {
    tiers: Vec<RetryTier>,
}

impl RetryTiers {
    /// Build a custom table from `(max_attempt, delay)` pairs.
    pub fn new(tiers: impl IntoIterator<Item = (u32, Duration)>) -> Result<Self, QueueError> {
        let tiers: Vec<RetryTier> = tiers
            .into_iter()
            .map(|(max_attempt, delay)| RetryTier::new(max_attempt, delay))
            .collect();

        if tiers.is_empty() {
            return Err(QueueError::Config(
                "retry tiers must contain at least one tier".to_string(),
            ));
        }

        if let Some(pair) = tiers.windows(2).find(|w| w[0].max_attempt >= w[1].max_attempt) {
            return Err(QueueError::Config(format!(
                "retry tier thresholds must be strictly increasing ({} then {})",
                pair[0].max_attempt, pair[1].max_attempt
            )));
        }

        Ok(Self { tiers })
    }

    /// 3s for the first failure, 60s through 29, one hour through 77, then discard.
    pub fn standard() -> Self {
        Self {
            tiers: vec![
                RetryTier::new(1, Duration::from_secs(3)),
                RetryTier::new(29, Duration::from_secs(60)),
                RetryTier::new(77, Duration::from_secs(3600)),
            ],
        }
    }

    pub fn next_action(&self, attempt: u32) -> RetryAction {
        self.tiers
            .iter()
            .find(|tier| attempt <= tier.max_attempt)
            .map(|tier| RetryAction::Release(tier.delay))
            .unwrap_or(RetryAction::Discard)
    }

    /// First attempt count that is discarded.
    pub fn max_attempts(&self) -> u32 {
        self.tiers
            .last()
            .map(|tier| tier.max_attempt.saturating_add(1))
            .unwrap_or(0)
    }

    pub fn tiers(&self) -> &[RetryTier] {
        &self.tiers
    }
}

impl Default for RetryTiers {
    fn default() -> Self {
        Self::standard()
    }
}

/// Failure counts for jobs dispatched on the current connection.
///
/// An entry exists only for jobs whose handler failed; it is removed when the
/// job is acknowledged or discarded, and the whole map is reset on reconnect.
#[derive(Debug, Default)]
pub struct AttemptHistory {
    attempts: HashMap<JobId, u32>,
}

impl AttemptHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Previous failures of `id` (0 when unknown).
    pub fn get(&self, id: JobId) -> u32 {
        self.attempts.get(&id).copied().unwrap_or(0)
    }

    /// Increment and return the new failure count.
    pub fn record_failure(&mut self, id: JobId) -> u32 {
        let count = self.attempts.entry(id).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Overwrite the failure count for `id`.
    pub fn set(&mut self, id: JobId, attempts: u32) {
        self.attempts.insert(id, attempts);
    }

    pub fn clear(&mut self, id: JobId) {
        self.attempts.remove(&id);
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.attempts.contains_key(&id)
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
