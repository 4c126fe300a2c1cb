//! Bulk deletion of forwarded messages from groups.

use tracing::{error, info};

use crate::{
    domain::{ChatId, MessageId},
    engine::{EngineInner, ForwardingEngine},
    errors::TransportError,
    ledger::{EntryDraft, EntryKind},
    ports::TransportResult,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub groups: usize,
    /// Groups whose history could not be walked to the end.
    pub groups_failed: usize,
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl ForwardingEngine {
    /// Delete every forwarded message in each group.
    ///
    /// Failures are logged and skipped; only a ledger storage failure stops
    /// the sweep (and the engine).
    pub async fn sweep(&self, groups: &[ChatId]) -> SweepReport {
        let inner = &self.inner;
        let mut report = SweepReport::default();

        for &group in groups {
            if inner.is_shutting_down() {
                break;
            }
            report.groups += 1;
            if let Err(e) = sweep_group(inner, group, &mut report).await {
                report.groups_failed += 1;
                error!(group = %group, "sweep aborted for group: {e}");
                inner.log(format!("Error sweeping {group}: {e}"));
            }
        }

        info!(
            groups = report.groups,
            deleted = report.deleted,
            failed = report.failed,
            "sweep finished"
        );
        inner.log(format!(
            "Sweep finished: {} deleted, {} failed across {} groups",
            report.deleted, report.failed, report.groups
        ));
        report
    }
}

async fn sweep_group(
    inner: &EngineInner,
    group: ChatId,
    report: &mut SweepReport,
) -> TransportResult<()> {
    let mut messages = inner.transport.iter_messages(group).await?;

    while let Some(msg) = messages.next().await? {
        if inner.is_shutting_down() {
            break;
        }
        report.scanned += 1;
        if !msg.is_forward {
            continue;
        }

        match delete_with_retry(inner, group, msg.message_id).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                report.failed += 1;
                error!(group = %group, msg_id = %msg.message_id, "delete failed: {e}");
                inner.log(format!(
                    "Error deleting message {} in {group}: {e}",
                    msg.message_id
                ));
                continue;
            }
        }

        let entry = match inner
            .ledger
            .append(EntryDraft::deleted(group, msg.message_id))
            .await
        {
            Ok(e) => e,
            Err(e) => {
                inner.fail(e);
                break;
            }
        };
        report.deleted += 1;
        let count = inner.stats.increment(group, EntryKind::Deleted).await;
        inner.sink.on_history_updated(&entry);
        inner.sink.on_stats_updated(group, EntryKind::Deleted, count);
        inner.log(format!("Deleted message {} in {group}", msg.message_id));
    }
    Ok(())
}

/// `Ok(false)` means the engine shut down while waiting.
async fn delete_with_retry(
    inner: &EngineInner,
    group: ChatId,
    id: MessageId,
) -> TransportResult<bool> {
    if !wait_group(inner, group).await {
        return Ok(false);
    }
    match inner.transport.delete_message(group, id).await {
        Err(TransportError::FloodWait(wait)) => {
            info!(group = %group, "flood wait {:?} while deleting; retrying once", wait);
            inner.limiter.report_flood_wait(group, wait).await;
            inner.save_rate_limits().await;
            if !wait_group(inner, group).await {
                return Ok(false);
            }
            inner.transport.delete_message(group, id).await?;
            Ok(true)
        }
        other => other.map(|()| true),
    }
}

async fn wait_group(inner: &EngineInner, group: ChatId) -> bool {
    inner.wait_turn(group, &inner.shutdown_token()).await
}
