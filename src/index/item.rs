//! The unit of archival work and its wire format.
//!
//! Items are persisted as compact JSON records; the field names here are the
//! on-disk format and must stay stable across releases.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::truncate_chars;

/// Lifecycle position of an item.
///
/// NEW → ENQUEUED → INPROGRESS → {DONE | SKIPPED | FAILED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    New,
    Enqueued,
    #[serde(rename = "INPROGRESS")]
    InProgress,
    Done,
    Skipped,
    Failed,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::New,
        Status::Enqueued,
        Status::InProgress,
        Status::Done,
        Status::Skipped,
        Status::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Enqueued => "ENQUEUED",
            Status::InProgress => "INPROGRESS",
            Status::Done => "DONE",
            Status::Skipped => "SKIPPED",
            Status::Failed => "FAILED",
        }
    }

    /// Terminal statuses are never re-leased.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Skipped | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Status::New),
            "ENQUEUED" => Ok(Status::Enqueued),
            "INPROGRESS" => Ok(Status::InProgress),
            "DONE" => Ok(Status::Done),
            "SKIPPED" => Ok(Status::Skipped),
            "FAILED" => Ok(Status::Failed),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Metadata fetched from the upstream API before admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Reference to the storage volume an archived item landed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    pub id: String,
}

/// One archived artifact: path relative to the volume root, content hash,
/// size in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(alias = "Path")]
    pub path: String,
    #[serde(alias = "Hash")]
    pub hash: String,
    #[serde(alias = "Size")]
    pub size: u64,
}

/// The unit of work, keyed by an opaque 11-character identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storages: Vec<StorageRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Item {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Status::New,
            storages: Vec::new(),
            files: Vec::new(),
            deadline: None,
            attempt: 0,
            retry_after: None,
            meta: None,
            reason: String::new(),
        }
    }

    /// Secondary-index key: the status string, the `::` separator, the id.
    /// The encoding fixes the status-prefix scan order.
    pub fn status_key(&self) -> String {
        status_key(self.status, &self.id)
    }

    /// Drop scheduling fields that only make sense for in-flight items.
    pub fn clear_system(&mut self) {
        self.retry_after = None;
        self.attempt = 0;
        self.deadline = None;
    }

    /// One human-readable line for `list` output.
    pub fn row(&self) -> String {
        let (date, channel, title) = match &self.meta {
            Some(meta) => (
                meta.published_at
                    .map(|t| t.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
                truncate_chars(&meta.channel_title, 20),
                truncate_chars(&meta.title, 30),
            ),
            None => (String::new(), String::new(), String::new()),
        };

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.id,
            self.status,
            date,
            channel,
            title,
            self.short_reason()
        )
        .replace('\n', " ")
    }

    /// Shorten upstream failure text for tabular output: strip the chatty
    /// wrappers the fetcher passes through and collapse whitespace.
    fn short_reason(&self) -> String {
        let mut r = self.reason.as_str();

        for marker in ["YouTube said:", "Content Warning"] {
            if let Some(pos) = r.find(marker) {
                r = &r[pos + marker.len()..];
            }
        }
        if let Some(pos) = r.find("Sorry") {
            r = &r[..pos];
        }

        let collapsed = r.split_whitespace().collect::<Vec<_>>().join(" ");
        truncate_chars(&collapsed, 90)
    }
}

pub(crate) fn status_key(status: Status, id: &str) -> String {
    format!("{}::{}", status, id)
}

/// Prefix under which all ids of a given status sort in the secondary index.
pub(crate) fn status_prefix(status: Status) -> String {
    format!("{}::", status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_as_uppercase() {
        assert_eq!(
            serde_json::to_string(&Status::InProgress).unwrap(),
            "\"INPROGRESS\""
        );
        assert_eq!(
            serde_json::from_str::<Status>("\"ENQUEUED\"").unwrap(),
            Status::Enqueued
        );
    }

    #[test]
    fn item_round_trips_exactly() {
        let item = Item {
            id: "VIDEOAAAAAA".to_string(),
            status: Status::Done,
            storages: vec![StorageRef {
                id: "d7d5e3a4-4a4e-4c5e-8e9e-000000000001".to_string(),
            }],
            files: vec![FileRecord {
                path: "2024/01/20240102_VIDEOAAAAAA/a.mp4".to_string(),
                hash: "deadbeef".to_string(),
                size: 1234,
            }],
            deadline: Some("2024-01-02T03:04:05Z".parse().unwrap()),
            attempt: 2,
            retry_after: Some("2024-01-02T03:05:05Z".parse().unwrap()),
            meta: Some(Meta {
                title: "T".to_string(),
                description: "D".to_string(),
                channel_id: "C".to_string(),
                channel_title: "CT".to_string(),
                tags: vec!["a".to_string()],
                published_at: Some("2024-01-02T03:04:05Z".parse().unwrap()),
            }),
            reason: "because".to_string(),
        };

        let encoded = serde_json::to_string(&item).unwrap();
        let decoded: Item = serde_json::from_str(&encoded).unwrap();
        assert_eq!(item, decoded);
    }

    #[test]
    fn minimal_item_stays_compact() {
        let item = Item::new("VIDEOAAAAAA");
        let encoded = serde_json::to_string(&item).unwrap();
        assert_eq!(encoded, r#"{"id":"VIDEOAAAAAA","status":"NEW"}"#);
    }

    #[test]
    fn status_key_encoding() {
        let mut item = Item::new("abc");
        item.status = Status::InProgress;
        assert_eq!(item.status_key(), "INPROGRESS::abc");
    }

    #[test]
    fn file_record_accepts_capitalised_aliases() {
        let rec: FileRecord =
            serde_json::from_str(r#"{"Path":"a/b.mkv","Hash":"ff","Size":10}"#).unwrap();
        assert_eq!(rec.path, "a/b.mkv");
        assert_eq!(rec.size, 10);
    }

    #[test]
    fn short_reason_strips_wrappers() {
        let mut item = Item::new("abc");
        item.reason = "ERROR: blah blah; YouTube said:   This video is private  ".to_string();
        assert_eq!(item.row().split('\t').nth(5).unwrap(), "This video is private");
    }
}
