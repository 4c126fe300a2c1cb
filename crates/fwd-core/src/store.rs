//! On-disk state: rule set, rate-limit table and the ledger file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    ledger::JsonlLedgerStore,
    rate_limit::CooldownRecord,
    routing::ForwardingRule,
    Result,
};

const RULES_FILE: &str = "rules.json";
const RATE_LIMITS_FILE: &str = "rate_limits.json";
const LEDGER_FILE: &str = "ledger.jsonl";

/// Contents of `rules.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SavedRules {
    #[serde(default)]
    pub saved_at: String,
    /// First rule id not yet handed out. Ids of removed rules are never reused.
    #[serde(default)]
    pub next_id: u64,
    pub rules: Vec<ForwardingRule>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RateLimitsFileData {
    saved_at: String,
    cooldowns: Vec<CooldownRecord>,
}

#[derive(Clone, Debug)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Use `root` for state, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules_path(&self) -> PathBuf {
        self.root.join(RULES_FILE)
    }

    pub fn rate_limits_path(&self) -> PathBuf {
        self.root.join(RATE_LIMITS_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn ledger_store(&self) -> JsonlLedgerStore {
        JsonlLedgerStore::new(self.ledger_path())
    }

    pub fn load_rules(&self) -> Result<SavedRules> {
        Ok(load_json::<SavedRules>(&self.rules_path())?.unwrap_or_default())
    }

    pub fn save_rules(&self, rules: &[ForwardingRule], next_id: u64) -> Result<()> {
        let data = SavedRules {
            saved_at: crate::utils::now_rfc3339(),
            next_id,
            rules: rules.to_vec(),
        };
        save_json(&self.rules_path(), &data)
    }

    pub fn load_rate_limits(&self) -> Result<Vec<CooldownRecord>> {
        Ok(load_json::<RateLimitsFileData>(&self.rate_limits_path())?
            .map(|d| d.cooldowns)
            .unwrap_or_default())
    }

    pub fn save_rate_limits(&self, cooldowns: &[CooldownRecord]) -> Result<()> {
        let data = RateLimitsFileData {
            saved_at: crate::utils::now_rfc3339(),
            cooldowns: cooldowns.to_vec(),
        };
        save_json(&self.rate_limits_path(), &data)
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&txt)?))
}

/// Write through a sibling temp file so a crash never leaves half a file.
fn save_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let txt = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, txt)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
