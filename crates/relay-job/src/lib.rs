use std::fmt;

use chrono::{DateTime, Utc};

/// Catalog item identifier (numeric App Store track id, kept as text).
///
/// NOTE: This is also the dedup key for the admission queue and the lookup key
/// for persisted records, so it is length-bounded by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ItemId(pub String);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RegionCode(pub String);

impl RegionCode {
    pub const DEFAULT: &'static str = "us";
}

impl Default for RegionCode {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id for one run of a job; shows up in logs only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobRunId(pub String);

impl JobRunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a request came from; replies and status messages go back here.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobOrigin {
    pub chat_id: i64,
    pub message_id: i64,
    /// Message the request itself replied to (forum topic root, usually).
    pub reply_context: Option<i64>,
    pub sender_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub run_id: JobRunId,
    pub item_id: ItemId,
    pub region: RegionCode,
    pub origin: JobOrigin,
    /// Logical enqueue order, stamped by the runner on submit.
    pub seq: u64,
}

impl Job {
    pub fn new(item_id: ItemId, region: RegionCode, origin: JobOrigin) -> Self {
        Self {
            run_id: JobRunId::new(),
            item_id,
            region,
            origin,
            seq: 0,
        }
    }
}

/// Persisted description of an acquired app, written by the acquisition tool
/// and completed (`file_id`) once the upload succeeds.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AppRecord {
    pub item_id: ItemId,
    /// Message id of the uploaded document; `None`/0 means not uploaded yet.
    pub file_id: Option<i64>,
    pub bundle_id: String,
    pub filename: String,
    pub track_name: String,
    pub version: String,
    pub release_notes: String,
    pub release_date: Option<DateTime<Utc>>,
    pub store_url: String,
    pub artwork_url: String,
    /// Destination chat the artifact is uploaded to.
    pub chat_id: String,
    pub topic_id: Option<String>,
}

impl AppRecord {
    pub fn uploaded_file_id(&self) -> Option<i64> {
        self.file_id.filter(|id| *id != 0)
    }

    /// An upload needs all of these; the tool occasionally writes partial rows.
    pub fn is_deliverable(&self) -> bool {
        [
            &self.filename,
            &self.bundle_id,
            &self.store_url,
            &self.artwork_url,
        ]
        .iter()
        .all(|v| !v.trim().is_empty())
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.track_name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AppRecord {
        AppRecord {
            item_id: ItemId("123456789".to_string()),
            file_id: None,
            bundle_id: "com.example.app".to_string(),
            filename: "com.example.app_1.2.ipa".to_string(),
            track_name: "Example".to_string(),
            version: "1.2".to_string(),
            release_notes: "Fixes".to_string(),
            release_date: None,
            store_url: "https://apps.apple.com/us/app/x/id123456789".to_string(),
            artwork_url: "https://example.invalid/art.png".to_string(),
            chat_id: "-100".to_string(),
            topic_id: None,
        }
    }

    #[test]
    fn run_id_is_non_empty() {
        let id = JobRunId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn zero_file_id_counts_as_not_uploaded() {
        let mut r = record();
        assert_eq!(r.uploaded_file_id(), None);
        r.file_id = Some(0);
        assert_eq!(r.uploaded_file_id(), None);
        r.file_id = Some(42);
        assert_eq!(r.uploaded_file_id(), Some(42));
    }

    #[test]
    fn blank_bundle_id_is_not_deliverable() {
        let mut r = record();
        assert!(r.is_deliverable());
        r.bundle_id = "  ".to_string();
        assert!(!r.is_deliverable());
    }

    #[test]
    fn default_region_is_us() {
        assert_eq!(RegionCode::default().0, "us");
    }

    #[test]
    fn job_serializes_with_item_id() {
        let job = Job::new(
            ItemId("1".to_string()),
            RegionCode::default(),
            JobOrigin {
                chat_id: 1,
                message_id: 2,
                reply_context: None,
                sender_id: Some(3),
            },
        );
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["item_id"], "1");
        assert_eq!(v["region"], "us");
    }
}
