//! Telegram HTML renderings of rules, history and counters.

use crate::{
    ledger::{EntryKind, HistoryEntry},
    routing::ForwardingRule,
    stats::Counts,
    sweep::SweepReport,
    utils::short_timestamp,
};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn format_rule(rule: &ForwardingRule) -> String {
    let targets = rule
        .targets
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let status = match rule.status {
        crate::routing::RuleStatus::Active => "",
        crate::routing::RuleStatus::Paused => " <i>(paused)</i>",
        crate::routing::RuleStatus::Removed => " <i>(removed)</i>",
    };

    let mut out = format!(
        "<b>{}</b> <code>{}</code> → <code>{}</code>{status}",
        rule.id, rule.key.source, targets
    );
    if !rule.delay.is_zero() {
        out.push_str(&format!("\n   delay {}ms", rule.delay.as_millis()));
    }
    let f = &rule.filter;
    if !f.keywords.is_empty() {
        out.push_str(&format!(
            "\n   keywords: {}",
            escape_html(&f.keywords.join(", "))
        ));
    }
    if !f.user_ids.is_empty() {
        out.push_str(&format!("\n   users: {}", join_ids(f.user_ids.iter().map(|u| u.0))));
    }
    if !f.blocked_users.is_empty() {
        out.push_str(&format!(
            "\n   blocked: {}",
            join_ids(f.blocked_users.iter().map(|u| u.0))
        ));
    }
    out
}

pub fn format_rules(rules: &[impl AsRef<ForwardingRule>]) -> String {
    if rules.is_empty() {
        return "No forwarding rules.".to_string();
    }
    let body = rules
        .iter()
        .map(|r| format_rule(r.as_ref()))
        .collect::<Vec<_>>()
        .join("\n");
    format!("📋 <b>Forwarding rules</b>\n\n{body}")
}

pub fn format_history(title: &str, entries: &[HistoryEntry]) -> String {
    if entries.is_empty() {
        return format!("{title}: nothing yet.");
    }
    let lines = entries
        .iter()
        .map(|e| match e.kind {
            EntryKind::Forwarded => format!(
                "<code>{}</code> #{} {} → {}",
                short_timestamp(&e.timestamp),
                e.message_id,
                e.source,
                match e.topic {
                    Some(t) => format!("{}:{t}", e.target),
                    None => e.target.to_string(),
                }
            ),
            EntryKind::Deleted => format!(
                "<code>{}</code> #{} deleted in {}",
                short_timestamp(&e.timestamp),
                e.message_id,
                e.target
            ),
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("<b>{title}</b>\n\n{lines}")
}

pub fn format_stats(counts: &Counts) -> String {
    if counts.is_empty() {
        return "No statistics yet.".to_string();
    }
    let mut out = String::from("📊 <b>Statistics</b>\n");
    for ((chat, kind), n) in counts {
        out.push_str(&format!("\n<code>{chat}</code> {}: {n}", kind.as_str()));
    }
    out
}

pub fn format_sweep_report(r: &SweepReport) -> String {
    let mut out = format!(
        "🧹 Sweep done: {} deleted, {} failed ({} messages scanned in {} groups)",
        r.deleted, r.failed, r.scanned, r.groups
    );
    if r.groups_failed > 0 {
        out.push_str(&format!("\n⚠️ {} groups could not be read", r.groups_failed));
    }
    out
}

fn join_ids(ids: impl Iterator<Item = i64>) -> String {
    ids.map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}
