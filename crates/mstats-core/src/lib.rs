//! Core domain model for the Medium stats importer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mstats-core";

/// Number of `|`-delimited fields in one export line.
pub const EXPORT_FIELD_COUNT: usize = 11;

/// Column names of the export, in file order.
pub const EXPORT_COLUMNS: [&str; EXPORT_FIELD_COUNT] = [
    "id",
    "title",
    "link",
    "publication",
    "duration",
    "views",
    "reads",
    "readRatio",
    "fans",
    "publishDate",
    "liveDate",
];

/// Latest-wins statistics for one article, keyed by `id`.
///
/// `last_update_time` is not carried here: the store stamps it with the
/// write transaction's timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSnapshot {
    pub id: String,
    pub title: String,
    pub link: String,
    pub publication: String,
    pub minutes_to_read: i64,
    pub views: i64,
    pub reads: i64,
    pub read_ratio: f64,
    pub fans: i64,
    pub publish_date: String,
    pub live_date: String,
}

/// View/read counts observed for one article on one report date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewReadHistoryEntry {
    pub id: String,
    pub observed_date: NaiveDate,
    pub views: i64,
    pub reads: i64,
}

/// One keyed upsert against either dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "row", rename_all = "snake_case")]
pub enum Mutation {
    UpsertSnapshot(ArticleSnapshot),
    UpsertHistory(ViewReadHistoryEntry),
}

/// Every upsert produced from one export file, committed as a unit.
///
/// Keys are unique within each list; ordering follows first appearance in
/// the file.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MutationBatch {
    pub snapshots: Vec<ArticleSnapshot>,
    pub history: Vec<ViewReadHistoryEntry>,
}

impl MutationBatch {
    pub fn len(&self) -> usize {
        self.snapshots.len() + self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.history.is_empty()
    }

    /// Snapshot upserts first, then history upserts.
    pub fn mutations(&self) -> impl Iterator<Item = Mutation> + '_ {
        self.snapshots
            .iter()
            .cloned()
            .map(Mutation::UpsertSnapshot)
            .chain(self.history.iter().cloned().map(Mutation::UpsertHistory))
    }
}

/// Object-change notification emitted by the blob store when an export lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectNotification {
    pub bucket: String,
    pub name: String,
    #[serde(default)]
    pub metageneration: Option<String>,
    #[serde(default)]
    pub resource_state: Option<String>,
    #[serde(default)]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

impl ObjectNotification {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            metageneration: None,
            resource_state: None,
            time_created: None,
            updated: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str) -> ArticleSnapshot {
        ArticleSnapshot {
            id: id.to_string(),
            title: "t".into(),
            link: "http://x".into(),
            publication: "p".into(),
            minutes_to_read: 3,
            views: 10,
            reads: 5,
            read_ratio: 0.5,
            fans: 1,
            publish_date: "2024-04-20".into(),
            live_date: "2024-04-20".into(),
        }
    }

    #[test]
    fn batch_lists_snapshots_before_history() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let batch = MutationBatch {
            snapshots: vec![snapshot("a")],
            history: vec![ViewReadHistoryEntry {
                id: "a".into(),
                observed_date: date,
                views: 10,
                reads: 5,
            }],
        };

        let kinds: Vec<_> = batch
            .mutations()
            .map(|m| matches!(m, Mutation::UpsertSnapshot(_)))
            .collect();
        assert_eq!(kinds, vec![true, false]);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert!(MutationBatch::default().is_empty());
    }

    #[test]
    fn notification_uses_storage_field_names() {
        let json = r#"{
            "bucket": "medium-stats",
            "name": "test/stats-medium-metrics-2024-05-01.csv",
            "metageneration": "1",
            "resourceState": "exists",
            "timeCreated": "2024-05-01T06:00:00Z",
            "updated": "2024-05-01T06:00:00Z"
        }"#;
        let event: ObjectNotification = serde_json::from_str(json).unwrap();
        assert_eq!(event.bucket, "medium-stats");
        assert_eq!(event.resource_state.as_deref(), Some("exists"));
        assert!(event.time_created.is_some());

        let minimal: ObjectNotification =
            serde_json::from_str(r#"{"bucket":"b","name":"n"}"#).unwrap();
        assert_eq!(minimal, ObjectNotification::new("b", "n"));
    }
}
