//! IPTV catalog ingestion core
//!
//! Ingests remote M3U playlists and XMLTV guides, normalizes them into an
//! in-memory channel catalog with "now playing" lookup, and keeps both
//! fresh on a time-to-live basis without blocking concurrent readers. The
//! HTTP layer that exposes manifest/catalog/stream endpoints consumes this
//! crate through [`CatalogCache`].

pub mod cache;
pub mod config;
pub mod epg;
pub mod error;
pub mod m3u;
pub mod models;
pub mod url_norm;


pub use cache::{CatalogCache, HttpFetcher, SourceFetcher};
pub use config::CoreConfig;
pub use epg::{GuideIndex, ProgrammeEntry};
pub use error::CatalogError;
pub use models::{CacheStatus, CatalogSnapshot, Channel, GuideSnapshot, StreamEntry};
