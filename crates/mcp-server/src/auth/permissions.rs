//! Permission labels attached to auth tokens.
//!
//! Labels are parsed from the comma-separated lists in the token
//! configuration and kept alongside each token. Command dispatch does not
//! consult them; they are surfaced in logs only.

use std::collections::BTreeSet;
use std::fmt;

/// Label granting every permission.
pub const ALL: &str = "all";

/// Set of permission labels held by one token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    labels: BTreeSet<String>,
}

impl PermissionSet {
    /// Parse a comma-separated label list. Blank entries are dropped,
    /// labels are trimmed and lowercased.
    pub fn parse(list: &str) -> Self {
        let labels = list
            .split(',')
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty())
            .collect();
        Self { labels }
    }

    /// Full-access set (`all`).
    pub fn all() -> Self {
        Self::parse(ALL)
    }

    /// Whether `label` is granted, directly or through `all`.
    pub fn grants(&self, label: &str) -> bool {
        self.labels.contains(ALL) || self.labels.contains(&label.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.labels().collect();
        write!(f, "{}", joined.join(","))
    }
}
