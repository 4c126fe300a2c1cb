use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::UserId;

/// Set of user ids. `add`/`remove` are idempotent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserSet(BTreeSet<UserId>);

impl UserSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the user was not already present.
    pub fn add(&mut self, user: UserId) -> bool {
        self.0.insert(user)
    }

    /// Returns `true` if the user was present.
    pub fn remove(&mut self, user: UserId) -> bool {
        self.0.remove(&user)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.0.contains(&user)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = UserId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<UserId> for UserSet {
    fn from_iter<T: IntoIterator<Item = UserId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-rule message predicate.
///
/// An empty list means "no restriction on that axis".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Case-sensitive substrings; any one must appear in the text.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Allow-list of senders.
    #[serde(default)]
    pub user_ids: UserSet,
    /// Deny-list of senders, checked before the allow-list.
    #[serde(default)]
    pub blocked_users: UserSet,
}

impl Filter {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Decide whether a message from `sender` should be forwarded.
    ///
    /// Messages without a known sender (anonymous admins, channel posts) never
    /// pass a non-empty allow-list.
    pub fn matches(&self, text: &str, sender: Option<UserId>) -> bool {
        if let Some(s) = sender {
            if self.blocked_users.contains(s) {
                return false;
            }
        }

        if !self.user_ids.is_empty() {
            match sender {
                Some(s) if self.user_ids.contains(s) => {}
                _ => return false,
            }
        }

        if !self.keywords.is_empty() && !self.keywords.iter().any(|k| text.contains(k.as_str())) {
            return false;
        }

        true
    }

    pub fn is_unrestricted(&self) -> bool {
        self.keywords.is_empty() && self.user_ids.is_empty() && self.blocked_users.is_empty()
    }
}
