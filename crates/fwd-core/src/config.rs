use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::UserId, errors::Error, Result};

/// Typed configuration, read from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub telegram_allowed_users: Vec<i64>,

    // State
    pub state_dir: PathBuf,
    pub history_view_limit: usize,

    // Forwarding defaults
    pub default_delay: Duration,

    // Telegram adapter
    pub seen_per_chat: usize,
    pub telegram_safe_limit: usize,

    // Presentation
    pub sink_buffer: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|k| env::var(k).ok())
    }

    /// Build from an arbitrary key lookup (used by `load` and tests).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Required env vars
        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        let telegram_allowed_users = parse_csv_i64(get("TELEGRAM_ALLOWED_USERS"));

        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        if telegram_allowed_users.is_empty() {
            return Err(Error::Config(
                "TELEGRAM_ALLOWED_USERS environment variable is required".to_string(),
            ));
        }

        let state_dir = PathBuf::from(
            get("FWD_STATE_DIR")
                .and_then(non_empty)
                .unwrap_or("/tmp/tgfwd".to_string()),
        );
        let history_view_limit = parse_num(&get, "FWD_HISTORY_VIEW_LIMIT")?.unwrap_or(100);
        let default_delay =
            Duration::from_millis(parse_num(&get, "FWD_DEFAULT_DELAY_MS")?.unwrap_or(2000));
        let seen_per_chat = parse_num(&get, "FWD_SEEN_PER_CHAT")?.unwrap_or(1000);
        let telegram_safe_limit = parse_num(&get, "TELEGRAM_SAFE_LIMIT")?.unwrap_or(4000);
        let sink_buffer = parse_num(&get, "FWD_SINK_BUFFER")?.unwrap_or(256);

        if history_view_limit == 0 {
            return Err(Error::Config(
                "FWD_HISTORY_VIEW_LIMIT must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            telegram_bot_token,
            telegram_allowed_users,
            state_dir,
            history_view_limit,
            default_delay,
            seen_per_chat,
            telegram_safe_limit,
            sink_buffer,
        })
    }

    pub fn is_admin(&self, user: Option<UserId>) -> bool {
        user.is_some_and(|u| self.telegram_allowed_users.contains(&u.0))
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

/// Unset means default; set but unparsable is an error.
fn parse_num<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = get(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
