//! Record model.
//!
//! # Overview
//!
//! A record is one scraped account identifier with a lifecycle status:
//!
//! ```text
//! unused ──claim──→ used ──update──→ processed / invalid / ...
//!    ↑                                   │
//!    └────────── explicit reset ─────────┘
//! ```
//!
//! The status is open text as far as storage is concerned; only `unused`
//! has a special meaning, since that is the pool claims are drawn from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for a record.
///
/// RecordId is a 128-bit UUID assigned by the store when the record is
/// inserted. It never changes for the lifetime of the record.
///
/// # Examples
///
/// ```rust
/// use recordpool::RecordId;
///
/// let id = RecordId::new();
/// let parsed: RecordId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Creates a new random record ID using UUIDv4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a RecordId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::InvalidRequest(format!("malformed record id '{}'", s)))
    }
}

/// Lifecycle status of a record.
///
/// Well-known values get their own variant; anything else is preserved
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecordStatus {
    Unused,
    Used,
    Processed,
    Invalid,
    Other(String),
}

impl RecordStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RecordStatus::Unused => "unused",
            RecordStatus::Used => "used",
            RecordStatus::Processed => "processed",
            RecordStatus::Invalid => "invalid",
            RecordStatus::Other(s) => s,
        }
    }

    /// True for records that still belong to the claimable pool.
    pub fn is_unused(&self) -> bool {
        matches!(self, RecordStatus::Unused)
    }

    fn is_blank(&self) -> bool {
        matches!(self, RecordStatus::Other(s) if s.trim().is_empty())
    }
}

impl Default for RecordStatus {
    fn default() -> Self {
        RecordStatus::Unused
    }
}

impl From<String> for RecordStatus {
    fn from(s: String) -> Self {
        match s.trim() {
            "unused" => RecordStatus::Unused,
            "used" => RecordStatus::Used,
            "processed" => RecordStatus::Processed,
            "invalid" => RecordStatus::Invalid,
            other => RecordStatus::Other(other.to_string()),
        }
    }
}

impl From<&str> for RecordStatus {
    fn from(s: &str) -> Self {
        RecordStatus::from(s.to_string())
    }
}

impl From<RecordStatus> for String {
    fn from(status: RecordStatus) -> Self {
        match status {
            RecordStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for RecordStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(RecordStatus::from(s))
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub name: String,
    pub scraped_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default)]
    pub notes: String,
}

impl Record {
    /// Builds a fresh record from create input, assigning a new id and
    /// applying defaults for omitted fields.
    pub fn create(new: NewRecord) -> Result<Self> {
        let name = match new.name {
            Some(name) => validate_name(&name)?,
            None => return Err(Error::ValidationError("name is required".to_string())),
        };

        let status = match new.status {
            Some(status) if !status.is_blank() => status,
            _ => RecordStatus::Unused,
        };

        Ok(Self {
            id: RecordId::new(),
            name,
            scraped_at: new.scraped_at.unwrap_or_else(Utc::now),
            status,
            notes: new.notes.unwrap_or_default(),
        })
    }
}

/// Validates and normalizes a record name.
///
/// Names are trimmed, must be non-empty, and may not contain line breaks
/// since exports put one name per line.
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::ValidationError("name must not be empty".to_string()));
    }
    if name.contains(['\n', '\r']) {
        return Err(Error::ValidationError(
            "name must not contain line breaks".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Input for creating a record. Only `name` is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRecord {
    #[serde(default, alias = "username")]
    pub name: Option<String>,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: impl Into<RecordStatus>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn scraped_at(mut self, at: DateTime<Utc>) -> Self {
        self.scraped_at = Some(at);
        self
    }
}

/// Partial update. Fields left as `None` are not touched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, alias = "username")]
    pub name: Option<String>,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl RecordPatch {
    /// Patch that only changes the status.
    pub fn status(status: impl Into<RecordStatus>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.scraped_at.is_none()
            && self.status.is_none()
            && self.notes.is_none()
    }

    /// Validates the whole patch before touching the record, so a rejected
    /// patch leaves the record unchanged.
    pub fn apply(&self, record: &mut Record) -> Result<()> {
        let name = self.name.as_deref().map(validate_name).transpose()?;
        if matches!(&self.status, Some(status) if status.is_blank()) {
            return Err(Error::ValidationError("status must not be empty".to_string()));
        }

        if let Some(name) = name {
            record.name = name;
        }
        if let Some(at) = self.scraped_at {
            record.scraped_at = at;
        }
        if let Some(status) = &self.status {
            record.status = status.clone();
        }
        if let Some(notes) = &self.notes {
            record.notes = notes.clone();
        }
        Ok(())
    }
}

/// Search filter. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Substring of the name.
    pub name: Option<String>,
    /// Exact status.
    pub status: Option<RecordStatus>,
}

impl RecordFilter {
    pub fn by_status(status: impl Into<RecordStatus>) -> Self {
        Self {
            name: None,
            status: Some(status.into()),
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            status: None,
        }
    }

    pub fn matches(&self, record: &Record, case_insensitive: bool) -> bool {
        if let Some(status) = &self.status {
            if &record.status != status {
                return false;
            }
        }
        match &self.name {
            Some(needle) if case_insensitive => record
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            Some(needle) => record.name.contains(needle.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrips_known_and_custom_values() {
        assert_eq!(RecordStatus::from("unused"), RecordStatus::Unused);
        assert_eq!(RecordStatus::from(" used "), RecordStatus::Used);
        assert_eq!(
            RecordStatus::from("banned"),
            RecordStatus::Other("banned".to_string())
        );
        assert_eq!(String::from(RecordStatus::Processed), "processed");

        let json = serde_json::to_string(&RecordStatus::Invalid).unwrap();
        assert_eq!(json, "\"invalid\"");
        let parsed: RecordStatus = serde_json::from_str("\"flagged\"").unwrap();
        assert_eq!(parsed.as_str(), "flagged");
    }

    #[test]
    fn test_create_applies_defaults() {
        let record = Record::create(NewRecord::named("  alice  ")).unwrap();
        assert_eq!(record.name, "alice");
        assert_eq!(record.status, RecordStatus::Unused);
        assert_eq!(record.notes, "");
        assert!(record.scraped_at <= Utc::now());
    }

    #[test]
    fn test_create_requires_name() {
        let err = Record::create(NewRecord::default()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let err = Record::create(NewRecord::named("   ")).unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let err = Record::create(NewRecord::named("a\nb")).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_create_accepts_username_alias() {
        let new: NewRecord =
            serde_json::from_str(r#"{"username": "bob", "status": "processed"}"#).unwrap();
        let record = Record::create(new).unwrap();
        assert_eq!(record.name, "bob");
        assert_eq!(record.status, RecordStatus::Processed);
    }

    #[test]
    fn test_blank_status_on_create_defaults_to_unused() {
        let record = Record::create(NewRecord::named("carol").with_status("")).unwrap();
        assert_eq!(record.status, RecordStatus::Unused);
    }

    #[test]
    fn test_patch_only_touches_given_fields() {
        let mut record = Record::create(NewRecord::named("dave").with_notes("n1")).unwrap();
        let before = record.clone();

        RecordPatch::status("used").apply(&mut record).unwrap();
        assert_eq!(record.status, RecordStatus::Used);
        assert_eq!(record.name, before.name);
        assert_eq!(record.notes, before.notes);
        assert_eq!(record.scraped_at, before.scraped_at);
        assert_eq!(record.id, before.id);
    }

    #[test]
    fn test_rejected_patch_leaves_record_unchanged() {
        let mut record = Record::create(NewRecord::named("erin")).unwrap();
        let before = record.clone();

        let patch = RecordPatch {
            name: Some(String::new()),
            notes: Some("should not land".to_string()),
            ..Default::default()
        };
        assert!(patch.apply(&mut record).is_err());
        assert_eq!(record, before);
    }

    #[test]
    fn test_filter_matching() {
        let record = Record::create(NewRecord::named("InstaUser").with_status("used")).unwrap();

        assert!(RecordFilter::default().matches(&record, false));
        assert!(RecordFilter::by_name("User").matches(&record, false));
        assert!(!RecordFilter::by_name("user").matches(&record, false));
        assert!(RecordFilter::by_name("user").matches(&record, true));
        assert!(RecordFilter::by_status("used").matches(&record, true));
        assert!(!RecordFilter::by_status("unused").matches(&record, true));
    }

    #[test]
    fn test_record_id_parse() {
        assert!("not-a-uuid".parse::<RecordId>().is_err());
        let id = RecordId::new();
        assert_eq!(id.to_string().parse::<RecordId>().unwrap(), id);
    }
}
