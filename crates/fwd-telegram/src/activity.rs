//! Consumer side of the engine's presentation sink.
//!
//! Keeps the most recent log lines for `/log` and mirrors events to tracing.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::mpsc;
use tracing::debug;

use fwd_core::ports::SinkEvent;

pub const ACTIVITY_LINES: usize = 200;

#[derive(Debug)]
pub struct ActivityFeed {
    cap: usize,
    lines: Mutex<VecDeque<String>>,
}

impl Default for ActivityFeed {
    fn default() -> Self {
        Self::new(ACTIVITY_LINES)
    }
}

impl ActivityFeed {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    fn lines(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines();
        lines.push_back(line);
        while lines.len() > self.cap {
            lines.pop_front();
        }
    }

    /// Last `n` lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let lines = self.lines();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Drain sink events until every sender is gone.
    pub async fn run(&self, mut rx: mpsc::Receiver<SinkEvent>) {
        while let Some(ev) = rx.recv().await {
            match ev {
                SinkEvent::Log(line) => self.push(line),
                SinkEvent::History(e) => {
                    debug!(seq = e.seq, kind = e.kind.as_str(), dest = %e.target, "history updated")
                }
                SinkEvent::Stats {
                    target,
                    kind,
                    count,
                } => debug!(dest = %target, kind = kind.as_str(), count, "stats updated"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_only_recent_log_lines() {
        let feed = ActivityFeed::new(2);
        let (tx, rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.send(SinkEvent::Log(format!("line {i}"))).await.unwrap();
        }
        drop(tx);
        feed.run(rx).await;

        assert_eq!(feed.recent(10), vec!["line 1", "line 2"]);
        assert_eq!(feed.recent(1), vec!["line 2"]);
    }
}
