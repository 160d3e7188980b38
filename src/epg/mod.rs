//! XMLTV guide index and "now playing" lookup

pub mod parser;

use std::collections::HashMap;

use serde::Serialize;

/// One guide programme with absolute Unix-timestamp bounds. Entries whose
/// bounds failed to parse are never constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgrammeEntry {
    pub channel: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: i64,
    pub stop: i64,
}

/// Programmes keyed by normalized channel identifier. The per-key `Vec`
/// preserves document order, which is the lookup tie-break for
/// overlapping windows.
#[derive(Debug, Clone, Default)]
pub struct GuideIndex {
    programmes: HashMap<String, Vec<ProgrammeEntry>>,
}

impl GuideIndex {
    pub fn insert(&mut self, entry: ProgrammeEntry) {
        let key = normalize_key(&entry.channel);
        if key.is_empty() {
            return;
        }
        self.programmes.entry(key).or_default().push(entry);
    }

    /// Find the programme whose `[start, stop)` window contains `now` for
    /// the given tvg-id. First match in document order wins. A miss is a
    /// normal outcome, not an error.
    pub fn now_playing(&self, tvg_id: &str, now: i64) -> Option<&ProgrammeEntry> {
        self.programmes
            .get(&normalize_key(tvg_id))?
            .iter()
            .find(|p| p.start <= now && now < p.stop)
    }

    pub fn programme_count(&self) -> usize {
        self.programmes.values().map(Vec::len).sum()
    }

    pub fn channel_count(&self) -> usize {
        self.programmes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programmes.is_empty()
    }
}

/// Guide lookup keys are matched loosely: lowercased, keeping only ASCII
/// alphanumerics, `_` and `.`. Applied identically at index build time and
/// at lookup time.
pub fn normalize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect()
}
