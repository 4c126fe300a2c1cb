//! Per-destination flood-wait tracking.
//!
//! The map lock is only held long enough to fetch a destination's cell; waiting
//! happens outside any lock, so a flooded destination never blocks another.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use crate::domain::ChatId;

/// Upper bound for a single reported flood wait.
pub const MAX_FLOOD_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct Cooldown {
    until: Instant,
}

/// Persisted form of one rate-limit entry (wall-clock deadline).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub destination: ChatId,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    cells: Mutex<HashMap<ChatId, Arc<Mutex<Cooldown>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell(&self, dest: ChatId) -> Option<Arc<Mutex<Cooldown>>> {
        self.cells.lock().await.get(&dest).cloned()
    }

    async fn cell_or_insert(&self, dest: ChatId) -> Arc<Mutex<Cooldown>> {
        let mut map = self.cells.lock().await;
        map.entry(dest)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Cooldown {
                    until: Instant::now(),
                }))
            })
            .clone()
    }

    /// Suspend until `dest` may be sent to again. Returns how long we waited.
    ///
    /// Re-checks after waking in case a longer flood wait was reported meanwhile.
    pub async fn wait_if_needed(&self, dest: ChatId) -> Duration {
        let Some(cell) = self.cell(dest).await else {
            return Duration::ZERO;
        };

        let start = Instant::now();
        loop {
            let until = cell.lock().await.until;
            if Instant::now() >= until {
                return start.elapsed();
            }
            sleep_until(until).await;
        }
    }

    /// Record a provider flood wait. A longer existing cooldown is kept.
    pub async fn report_flood_wait(&self, dest: ChatId, wait: Duration) {
        let wait = wait.min(MAX_FLOOD_WAIT);
        let until = Instant::now() + wait;
        let cell = self.cell_or_insert(dest).await;
        let mut guard = cell.lock().await;
        if until > guard.until {
            guard.until = until;
        }
    }

    /// Same as `report_flood_wait` for raw provider seconds. Zero, negative and
    /// NaN values clamp to no wait.
    pub async fn report_flood_wait_secs(&self, dest: ChatId, seconds: f64) {
        let secs = seconds.max(0.0);
        let wait = Duration::try_from_secs_f64(secs).unwrap_or(MAX_FLOOD_WAIT);
        self.report_flood_wait(dest, wait).await;
    }

    /// Successful sends leave the table untouched; no entry is the steady state.
    pub async fn report_success(&self, dest: ChatId) {
        tracing::trace!(destination = %dest, "send ok");
    }

    /// Time left before `dest` may be sent to, if any.
    pub async fn remaining(&self, dest: ChatId) -> Option<Duration> {
        let cell = self.cell(dest).await?;
        let until = cell.lock().await.until;
        let left = until.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    /// Unexpired entries as wall-clock deadlines, for persistence.
    pub async fn snapshot(&self) -> Vec<CooldownRecord> {
        let cells: Vec<(ChatId, Arc<Mutex<Cooldown>>)> = self
            .cells
            .lock()
            .await
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        let now = Instant::now();
        let wall = Utc::now();
        let mut out = Vec::new();
        for (destination, cell) in cells {
            let left = cell.lock().await.until.saturating_duration_since(now);
            if left.is_zero() {
                continue;
            }
            let Ok(left) = chrono::Duration::from_std(left) else {
                continue;
            };
            out.push(CooldownRecord {
                destination,
                until: wall + left,
            });
        }
        out.sort_by_key(|r| r.destination);
        out
    }

    /// Load persisted deadlines; expired ones are dropped.
    pub async fn restore(&self, records: impl IntoIterator<Item = CooldownRecord>) {
        let wall = Utc::now();
        for rec in records {
            let Ok(left) = rec.until.signed_duration_since(wall).to_std() else {
                continue;
            };
            if !left.is_zero() {
                self.report_flood_wait(rec.destination, left).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_after_flood_wait_takes_at_least_n_seconds() {
        let rl = RateLimiter::new();
        let t = ChatId(-100);
        rl.report_flood_wait_secs(t, 3.0).await;

        let start = Instant::now();
        rl.wait_if_needed(t).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_after_expiry_is_immediate() {
        let rl = RateLimiter::new();
        let t = ChatId(-100);
        rl.report_flood_wait(t, Duration::from_secs(3)).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let waited = rl.wait_if_needed(t).await;
        assert_eq!(waited, Duration::ZERO);
        assert!(rl.remaining(t).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_destination_and_success_are_no_ops() {
        let rl = RateLimiter::new();
        rl.report_success(ChatId(1)).await;
        assert_eq!(rl.wait_if_needed(ChatId(1)).await, Duration::ZERO);
        assert!(rl.snapshot().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn larger_backoff_wins() {
        let rl = RateLimiter::new();
        let t = ChatId(5);
        rl.report_flood_wait(t, Duration::from_secs(10)).await;
        rl.report_flood_wait(t, Duration::from_secs(2)).await;
        assert!(rl.remaining(t).await.unwrap() > Duration::from_secs(9));

        rl.report_flood_wait(t, Duration::from_secs(20)).await;
        assert!(rl.remaining(t).await.unwrap() > Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_and_zero_delays_clamp_to_no_wait() {
        let rl = RateLimiter::new();
        rl.report_flood_wait_secs(ChatId(1), -4.0).await;
        rl.report_flood_wait_secs(ChatId(2), 0.0).await;
        rl.report_flood_wait_secs(ChatId(3), f64::NAN).await;
        for id in 1..=3 {
            assert_eq!(rl.wait_if_needed(ChatId(id)).await, Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flooded_destination_does_not_block_others() {
        let rl = Arc::new(RateLimiter::new());
        rl.report_flood_wait(ChatId(1), Duration::from_secs(60)).await;

        let slow = {
            let rl = rl.clone();
            tokio::spawn(async move { rl.wait_if_needed(ChatId(1)).await })
        };
        tokio::task::yield_now().await;

        let start = Instant::now();
        rl.wait_if_needed(ChatId(2)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!slow.is_finished());

        assert!(slow.await.unwrap() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn snapshot_round_trips_unexpired_entries() {
        let rl = RateLimiter::new();
        rl.report_flood_wait(ChatId(7), Duration::from_secs(600)).await;
        let snap = rl.snapshot().await;
        assert_eq!(snap.len(), 1);

        let expired = CooldownRecord {
            destination: ChatId(8),
            until: Utc::now() - chrono::Duration::seconds(5),
        };

        let restored = RateLimiter::new();
        restored
            .restore(snap.into_iter().chain(std::iter::once(expired)))
            .await;
        assert!(restored.remaining(ChatId(7)).await.unwrap() > Duration::from_secs(590));
        assert!(restored.remaining(ChatId(8)).await.is_none());
    }
}
