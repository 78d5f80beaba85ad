use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A person entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Normalized login.
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub dn: String,

    /// Company id derived from the DN; `None` when the DN does not follow
    /// the company pattern.
    pub company: Option<String>,

    pub department: Option<String>,
    pub local_id: Option<String>,

    #[serde(default)]
    pub mails: Vec<String>,

    /// Ids of the groups the user is a direct member of.
    #[serde(default)]
    pub groups: BTreeSet<String>,

    pub locked: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,

    /// Company the user was in before being isolated.
    pub isolated: Option<String>,

    /// Whether a password is set.
    #[serde(default)]
    pub secured: bool,
}

/// Input for creating or updating a user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserEdition {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    /// Requested group ids.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// A group reference inside a [`UserView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupRef {
    pub id: String,
    pub name: String,
    pub can_write: bool,
}

/// A user as seen by a principal: only visible groups are listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub department: Option<String>,
    pub local_id: Option<String>,
    pub mails: Vec<String>,
    pub locked: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub isolated: Option<String>,
    pub groups: Vec<GroupRef>,
    pub can_write: bool,
}

/// Decoded lock marker attribute.
///
/// Encoded as `<flag>|<epoch millis>|<author>|<previous company or empty>|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMarker {
    pub locked: DateTime<Utc>,
    pub locked_by: String,
    pub isolated: Option<String>,
}

impl LockMarker {
    pub fn encode(&self, flag: &str) -> String {
        format!(
            "{}|{}|{}|{}|",
            flag,
            self.locked.timestamp_millis(),
            self.locked_by,
            self.isolated.as_deref().unwrap_or("")
        )
    }

    /// Decode `value`; `None` unless it starts with `flag` and carries a
    /// valid timestamp.
    pub fn parse(value: &str, flag: &str) -> Option<Self> {
        if !value.starts_with(flag) {
            return None;
        }
        let fields: Vec<&str> = value.split('|').collect();
        let millis = fields.get(1)?.trim().parse::<i64>().ok()?;
        let locked = DateTime::from_timestamp_millis(millis)?;
        let locked_by = fields.get(2).copied().unwrap_or_default().to_string();
        let isolated = fields
            .get(3)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Some(Self {
            locked,
            locked_by,
            isolated,
        })
    }
}
