use std::{sync::Arc, time::Duration};

use teloxide::{prelude::*, types::ParseMode};
use tracing::{info, warn};

use fwd_core::{
    domain::{ChatId, TopicId, UserId},
    filter::{Filter, UserSet},
    formatting::{
        escape_html, format_history, format_rule, format_rules, format_stats,
        format_sweep_report,
    },
    ledger::{EntryKind, LedgerQuery},
    routing::{RuleId, RuleSpec, Target},
};

use crate::router::AppState;

const DEFAULT_LISTING: usize = 20;
const MAX_LISTING: usize = 100;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn parse_chat_id(s: &str) -> Result<ChatId, String> {
    s.trim()
        .parse::<i64>()
        .map(ChatId)
        .map_err(|_| format!("not a chat id: {s}"))
}

/// `<chat>` or `<chat>:<topic>`.
fn parse_target(s: &str) -> Result<Target, String> {
    match s.split_once(':') {
        None => parse_chat_id(s).map(Target::chat),
        Some((chat, topic)) => {
            let chat = parse_chat_id(chat)?;
            let topic = topic
                .parse::<i32>()
                .map_err(|_| format!("not a topic id: {topic}"))?;
            Ok(Target::topic(chat, TopicId(topic)))
        }
    }
}

fn parse_user_ids(s: &str) -> Result<UserSet, String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<i64>()
                .map(UserId)
                .map_err(|_| format!("not a user id: {p}"))
        })
        .collect()
}

fn parse_rule_id(s: &str) -> Result<RuleId, String> {
    let raw = s.trim().trim_start_matches('#');
    raw.parse::<u64>()
        .map(RuleId)
        .map_err(|_| format!("not a rule id: {s}"))
}

/// `<source> <target[:topic]>... [delay=<ms>] [keywords=a,b] [users=1,2] [block=3,4]`
fn parse_forward(arg: &str, default_delay: Duration) -> Result<RuleSpec, String> {
    let mut tokens = arg.split_whitespace();
    let source = parse_chat_id(tokens.next().ok_or("missing source chat")?)?;

    let mut targets = Vec::new();
    let mut filter = Filter::default();
    let mut delay = default_delay;

    for tok in tokens {
        let Some((key, value)) = tok.split_once('=') else {
            targets.push(parse_target(tok)?);
            continue;
        };
        match key {
            "delay" => {
                let ms = value
                    .parse::<u64>()
                    .map_err(|_| format!("delay must be milliseconds, got {value}"))?;
                delay = Duration::from_millis(ms);
            }
            "keywords" => {
                filter.keywords = value
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "users" => filter.user_ids = parse_user_ids(value)?,
            "block" => filter.blocked_users = parse_user_ids(value)?,
            other => return Err(format!("unknown option: {other}")),
        }
    }

    Ok(RuleSpec::new(source, targets)
        .with_filter(filter)
        .with_delay(delay))
}

fn parse_count(arg: &str) -> usize {
    arg.trim()
        .parse::<usize>()
        .unwrap_or(DEFAULT_LISTING)
        .clamp(1, MAX_LISTING)
}

/// Split on line boundaries so no chunk exceeds `limit` bytes.
fn split_lines(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut chunk = String::new();

    for line in text.lines() {
        if !chunk.is_empty() && chunk.len() + 1 + line.len() > limit {
            out.push(std::mem::take(&mut chunk));
        }
        if line.len() > limit {
            // Hard-cut an oversized line at char boundaries.
            let mut piece = String::new();
            for ch in line.chars() {
                if piece.len() + ch.len_utf8() > limit {
                    out.push(std::mem::take(&mut piece));
                }
                piece.push(ch);
            }
            chunk = piece;
            continue;
        }
        if !chunk.is_empty() {
            chunk.push('\n');
        }
        chunk.push_str(line);
    }
    if !chunk.is_empty() {
        out.push(chunk);
    }
    out
}

async fn reply_html(bot: &Bot, state: &AppState, chat: teloxide::types::ChatId, html: &str) {
    let limit = state.cfg.telegram_safe_limit.max(200);
    for chunk in split_lines(html, limit) {
        if let Err(e) = bot
            .send_message(chat, chunk)
            .parse_mode(ParseMode::Html)
            .await
        {
            warn!("reply failed: {e}");
        }
    }
}

fn failure(e: impl std::fmt::Display) -> String {
    format!("❌ {}", escape_html(&e.to_string()))
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat = msg.chat.id;
    let (cmd, arg) = parse_command(text);
    let engine = &state.engine;

    info!(command = %cmd, "admin command");

    let body = match cmd.as_str() {
        "start" | "help" => "📨 <b>Telegram Forwarder</b>\n\n\
<b>📋 Commands:</b>\n\
/forward &lt;source&gt; &lt;target[:topic]&gt;... [delay=ms] [keywords=a,b] [users=1,2] [block=3,4] - Add a forwarding rule\n\
/rules - List rules\n\
/pause &lt;id&gt; - Pause a rule\n\
/resume &lt;id&gt; - Resume a paused rule\n\
/unforward &lt;id&gt; - Remove a rule\n\
/allow &lt;id&gt; &lt;user&gt; - Add a sender to a rule's allow-list\n\
/disallow &lt;id&gt; &lt;user&gt; - Remove a sender from the allow-list\n\
/history [n] - Recent forwards\n\
/deletions [n] - Recent deletions\n\
/stats - Forwarded and deleted counts per chat\n\
/sweep &lt;group&gt;... - Delete forwarded messages in groups\n\
/log [n] - Recent engine activity\n\n\
<b>💡 Tips:</b>\n\
• Chat ids are numeric (channels and supergroups start with -100)\n\
• The bot must be a member of every source and target chat"
            .to_string(),

        "forward" => match parse_forward(&arg, state.cfg.default_delay) {
            Err(e) => failure(e),
            Ok(spec) => match engine.register(spec).await {
                Err(e) => failure(e),
                Ok(h) => match engine.routes().get(h.id).await {
                    Some(rule) => format!("✅ Rule registered\n\n{}", format_rule(&rule)),
                    None => format!("✅ Rule {} registered", h.id),
                },
            },
        },

        "rules" => format_rules(&engine.routes().rules().await),

        "pause" | "resume" | "unforward" => match parse_rule_id(&arg) {
            Err(e) => failure(e),
            Ok(id) => {
                let res = match cmd.as_str() {
                    "pause" => engine.pause(id).await.map(|()| "paused"),
                    "resume" => engine.resume(id).await.map(|()| "resumed"),
                    _ => engine
                        .unregister(id)
                        .await
                        .map(|changed| if changed { "removed" } else { "already removed" }),
                };
                match res {
                    Ok(what) => format!("✅ Rule {id} {what}"),
                    Err(e) => failure(e),
                }
            }
        },

        "allow" | "disallow" => edit_allow_list(&state, &arg, cmd == "allow").await,

        "history" | "deletions" => {
            let (kind, title) = if cmd == "history" {
                (EntryKind::Forwarded, "📜 Forwarding history")
            } else {
                (EntryKind::Deleted, "🗑 Deletion history")
            };
            let entries = engine
                .ledger()
                .recent(LedgerQuery::all().kind(kind), parse_count(&arg))
                .await;
            format_history(title, &entries)
        }

        "stats" => format_stats(&engine.stats().snapshot().await),

        "sweep" => {
            let groups: Result<Vec<ChatId>, String> =
                arg.split_whitespace().map(parse_chat_id).collect();
            match groups {
                Err(e) => failure(e),
                Ok(groups) if groups.is_empty() => "Usage: /sweep &lt;group&gt;...".to_string(),
                Ok(groups) => {
                    let n = groups.len();
                    let bot = bot.clone();
                    let state = state.clone();
                    tokio::spawn(async move {
                        let report = state.engine.sweep(&groups).await;
                        reply_html(&bot, &state, chat, &format_sweep_report(&report)).await;
                    });
                    format!("🧹 Sweeping {n} groups...")
                }
            }
        }

        "log" => {
            let lines = state.activity.recent(parse_count(&arg));
            if lines.is_empty() {
                "No activity yet.".to_string()
            } else {
                lines
                    .iter()
                    .map(|l| escape_html(l))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }

        _ => format!("Unknown command: /{}", escape_html(&cmd)),
    };

    reply_html(&bot, &state, chat, &body).await;
    Ok(())
}

/// Rules are immutable; an allow-list edit re-registers the rule.
async fn edit_allow_list(state: &AppState, arg: &str, allow: bool) -> String {
    let mut parts = arg.split_whitespace();
    let (Some(id), Some(user), None) = (parts.next(), parts.next(), parts.next()) else {
        return format!(
            "Usage: /{} &lt;rule id&gt; &lt;user id&gt;",
            if allow { "allow" } else { "disallow" }
        );
    };
    let id = match parse_rule_id(id) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };
    let user = match user.parse::<i64>() {
        Ok(u) => UserId(u),
        Err(_) => return failure(format!("not a user id: {user}")),
    };

    let engine = &state.engine;
    let Some(rule) = engine.routes().get(id).await else {
        return failure(format!("unknown rule: {id}"));
    };
    let mut spec = rule.spec();
    let changed = if allow {
        spec.filter.user_ids.add(user)
    } else {
        spec.filter.user_ids.remove(user)
    };
    if !changed {
        return format!("Nothing to do: rule {id} already has that allow-list.");
    }

    match engine.replace(id, spec).await {
        Err(e) => failure(e),
        Ok(h) => match engine.routes().get(h.id).await {
            Some(new) => format!("✅ Rule {id} replaced\n\n{}", format_rule(&new)),
            None => format!("✅ Rule {id} replaced by {}", h.id),
        },
    }
}
