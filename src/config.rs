//! Limits and intervals for the ingestion core

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Fallback refresh interval when the caller supplies no usable spec: 02:00.
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 2 * 3600;

/// Resource limits for playlist and guide ingestion.
///
/// All fields have serde defaults so a partial JSON config deserializes
/// into a fully usable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Hard cap on the total channel count across all playlist sources.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    /// Per-request wall-clock timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// TCP/TLS connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum bytes read from a single playlist response.
    #[serde(default = "default_playlist_max_bytes")]
    pub playlist_max_bytes: u64,
    /// Declared/streamed size ceiling for the guide document as transferred.
    #[serde(default = "default_guide_max_bytes")]
    pub guide_max_compressed_bytes: u64,
    /// Ceiling for the guide document after gzip decompression.
    #[serde(default = "default_guide_max_decompressed")]
    pub guide_max_decompressed_bytes: u64,
    /// Overall guide deadline covering download, decompression and parse.
    #[serde(default = "default_guide_deadline")]
    pub guide_deadline_secs: u64,
    /// Fixed guide refresh interval; guides are large, so this is longer
    /// than any typical playlist interval.
    #[serde(default = "default_guide_interval")]
    pub guide_interval_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_channels() -> usize { 10_000 }
fn default_fetch_timeout() -> u64 { 30 }
fn default_connect_timeout() -> u64 { 10 }
fn default_playlist_max_bytes() -> u64 { 100 * 1024 * 1024 }
fn default_guide_max_bytes() -> u64 { 100 * 1024 * 1024 }
fn default_guide_max_decompressed() -> u64 { 50 * 1024 * 1024 }
fn default_guide_deadline() -> u64 { 45 }
fn default_guide_interval() -> u64 { 6 * 3600 }
fn default_user_agent() -> String { "IptvCatalog/0.1".to_string() }

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            fetch_timeout_secs: default_fetch_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            playlist_max_bytes: default_playlist_max_bytes(),
            guide_max_compressed_bytes: default_guide_max_bytes(),
            guide_max_decompressed_bytes: default_guide_max_decompressed(),
            guide_deadline_secs: default_guide_deadline(),
            guide_interval_secs: default_guide_interval(),
            user_agent: default_user_agent(),
        }
    }
}

/// Parse an `"HH:MM"` update interval spec. Malformed specs fall back to
/// the 02:00 default rather than erroring.
pub fn parse_update_interval(spec: &str) -> Duration {
    match try_parse_interval(spec) {
        Some(interval) => interval,
        None => {
            warn!("malformed update interval {:?}, using default 02:00", spec);
            Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS)
        }
    }
}

fn try_parse_interval(spec: &str) -> Option<Duration> {
    let (hours, minutes) = spec.trim().split_once(':')?;
    let hours: u64 = hours.parse().ok()?;
    let minutes: u64 = minutes.parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_update_interval("02:00"), Duration::from_secs(7200));
        assert_eq!(parse_update_interval("00:30"), Duration::from_secs(1800));
        assert_eq!(parse_update_interval(" 12:05 "), Duration::from_secs(12 * 3600 + 300));
        assert_eq!(parse_update_interval("00:00"), Duration::from_secs(0));
    }

    #[test]
    fn test_malformed_interval_falls_back() {
        for spec in ["", "garbage", "2h", "02:99", "aa:bb", "02-00"] {
            assert_eq!(
                parse_update_interval(spec),
                Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS),
                "spec {:?}",
                spec
            );
        }
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_channels, 10_000);
        assert_eq!(config.guide_max_decompressed_bytes, 50 * 1024 * 1024);
        assert_eq!(config.guide_interval_secs, 6 * 3600);
    }
}
