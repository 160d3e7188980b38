//! Catalog data model: channels, snapshots and the status readout

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::epg::GuideIndex;

/// Genre assigned to channels whose playlist entry carries no group.
pub const DEFAULT_GENRE: &str = "Other";

/// One playable stream for a channel. Document order across entries is
/// the playback priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub url: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// Headers the player must send, collected from `#EXTVLCOPT:` lines.
    #[serde(rename = "requestHeaders", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// `tv|{tvg_id}_{source_index}` - unique within one catalog snapshot.
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    pub group: String,
    #[serde(rename = "tvgId")]
    pub tvg_id: String,
    #[serde(rename = "sourceIndex")]
    pub source_index: usize,
    /// Never empty: a metadata line without a following stream URL is
    /// discarded before it gets here.
    pub streams: Vec<StreamEntry>,
}

/// Immutable result of one successful playlist ingestion cycle.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub channels: Vec<Channel>,
    pub genres: BTreeSet<String>,
    /// Normalized, comma-joined source URL list this snapshot was built from.
    pub source_key: String,
    /// True when the global channel cap cut off one or more sources.
    pub truncated: bool,
    pub fetched_at: Instant,
    pub fetched_unix: i64,
}

impl CatalogSnapshot {
    /// The shared fallback when no catalog was ever fetched successfully:
    /// no channels, just the sentinel genre.
    pub fn empty(source_key: &str) -> Self {
        Self {
            channels: Vec::new(),
            genres: BTreeSet::from([DEFAULT_GENRE.to_string()]),
            source_key: source_key.to_string(),
            truncated: false,
            fetched_at: Instant::now(),
            fetched_unix: chrono::Utc::now().timestamp(),
        }
    }
}

/// Immutable result of one successful guide ingestion cycle. Lives on its
/// own refresh interval, independent of the catalog.
#[derive(Debug, Clone)]
pub struct GuideSnapshot {
    pub index: GuideIndex,
    pub fetched_at: Instant,
    pub fetched_unix: i64,
}

impl GuideSnapshot {
    pub fn new(index: GuideIndex) -> Self {
        Self {
            index,
            fetched_at: Instant::now(),
            fetched_unix: chrono::Utc::now().timestamp(),
        }
    }
}

/// Health readout over both cache slots.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub channel_count: usize,
    pub genre_count: usize,
    pub truncated: bool,
    /// Seconds since the catalog snapshot was fetched; absent when empty.
    pub catalog_age_secs: Option<u64>,
    pub programme_count: usize,
    pub guide_age_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_serializes_with_wire_names() {
        let channel = Channel {
            id: "tv|bbc1_0".to_string(),
            name: "BBC One".to_string(),
            logo: None,
            group: "News".to_string(),
            tvg_id: "bbc1".to_string(),
            source_index: 0,
            streams: vec![StreamEntry {
                url: "http://x/stream1".to_string(),
                display_name: "BBC One".to_string(),
                request_headers: BTreeMap::new(),
            }],
        };

        let json = serde_json::to_value(&channel).unwrap();
        assert_eq!(json["id"], "tv|bbc1_0");
        assert_eq!(json["tvgId"], "bbc1");
        assert_eq!(json["sourceIndex"], 0);
        assert_eq!(json["streams"][0]["displayName"], "BBC One");
        // empty header map and absent logo stay off the wire
        assert!(json["streams"][0].get("requestHeaders").is_none());
        assert!(json.get("logo").is_none());
    }

    #[test]
    fn test_empty_snapshot_keeps_sentinel_genre() {
        let snapshot = CatalogSnapshot::empty("");
        assert!(snapshot.channels.is_empty());
        assert!(snapshot.genres.contains(DEFAULT_GENRE));
        assert!(!snapshot.truncated);
    }
}
