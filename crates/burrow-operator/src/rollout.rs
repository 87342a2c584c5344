//! Staggered rollout planning
//!
//! Image upgrades restart every broker of a cluster. When many clusters are
//! upgraded at once the restarts are spread over a window: each cluster asks
//! the shared [`RolloutScheduler`] for a time, and gets the midpoint of the
//! widest free gap between the times already handed out.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;

/// Hands out upgrade times spread across a fixed window
#[derive(Debug)]
pub struct RolloutScheduler {
    window: TimeDelta,
    planned: Mutex<Vec<DateTime<Utc>>>,
}

impl RolloutScheduler {
    /// Create a scheduler; a zero window disables staggering
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            planned: Mutex::new(Vec::new()),
        }
    }

    /// Length of the rollout window
    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Pick and commit an upgrade time no earlier than `now`
    ///
    /// Times committed before `now` are forgotten first.
    pub fn plan_upgrade(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.window.is_zero() {
            return now;
        }

        let mut planned = self.planned.lock();
        planned.retain(|t| *t >= now);
        planned.sort_unstable();

        let next = next_upgrade_time(&planned, now, self.window);
        let idx = planned.partition_point(|t| *t <= next);
        planned.insert(idx, next);

        debug!(planned = %next, committed = planned.len(), "Planned upgrade");
        next
    }

    /// Commit `time` without planning
    pub fn add_upgrade_time(&self, time: DateTime<Utc>) {
        let mut planned = self.planned.lock();
        let idx = planned.partition_point(|t| *t <= time);
        planned.insert(idx, time);
    }

    /// Sorted snapshot of the committed times
    pub fn committed(&self) -> Vec<DateTime<Utc>> {
        self.planned.lock().clone()
    }
}

/// Midpoint of the widest gap in `now, planned.., now + window`
///
/// `planned` must be sorted and contain nothing before `now`. Ties go to
/// the earliest gap.
fn next_upgrade_time(
    planned: &[DateTime<Utc>],
    now: DateTime<Utc>,
    window: TimeDelta,
) -> DateTime<Utc> {
    if planned.is_empty() {
        return now;
    }

    let end = now
        .checked_add_signed(window)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let points: Vec<DateTime<Utc>> = std::iter::once(now)
        .chain(planned.iter().copied())
        .chain(std::iter::once(end))
        .collect();

    let mut best_start = now;
    let mut best_gap = TimeDelta::zero();
    let mut found = false;
    for pair in points.windows(2) {
        let gap = pair[1] - pair[0];
        if !found || gap > best_gap {
            best_start = pair[0];
            best_gap = gap;
            found = true;
        }
    }

    best_start + best_gap / 2
}
