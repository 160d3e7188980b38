//! EXTM3U playlist fetching and parsing
//!
//! Sources are processed strictly in input order; the source index is part
//! of every channel id, so reordering sources produces a different catalog.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use log::{debug, warn};

use crate::config::CoreConfig;
use crate::error::CatalogError;
use crate::models::{Channel, StreamEntry, DEFAULT_GENRE};

/// Result of one playlist ingestion cycle over all sources.
#[derive(Debug, Clone, Default)]
pub struct CatalogFetch {
    pub channels: Vec<Channel>,
    pub genres: BTreeSet<String>,
    pub truncated: bool,
}

/// Fetch and parse every source URL in order. A single failing source is
/// logged and skipped; the fetch only errors when every source failed, so
/// the cache can tell "empty playlists" from "network down".
pub fn fetch_catalog(urls: &[String], config: &CoreConfig) -> Result<CatalogFetch, CatalogError> {
    let mut fetch = CatalogFetch {
        genres: BTreeSet::from([DEFAULT_GENRE.to_string()]),
        ..Default::default()
    };
    let mut failed = 0usize;

    for (source_index, url) in urls.iter().enumerate() {
        if fetch.channels.len() >= config.max_channels {
            warn!(
                "channel cap {} reached, skipping remaining sources from index {}",
                config.max_channels, source_index
            );
            fetch.truncated = true;
            break;
        }
        match fetch_source(url, config) {
            Ok(content) => {
                let before = fetch.channels.len();
                parse_source(&content, source_index, config.max_channels, &mut fetch);
                debug!(
                    "source {} yielded {} channels",
                    source_index,
                    fetch.channels.len() - before
                );
            }
            Err(e) => {
                warn!("playlist source {} ({}) failed: {}", source_index, url, e);
                failed += 1;
            }
        }
    }

    if failed > 0 && failed == urls.len() {
        return Err(CatalogError::AllSourcesFailed(failed));
    }
    Ok(fetch)
}

fn fetch_source(url: &str, config: &CoreConfig) -> Result<String, CatalogError> {
    let agent = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(config.fetch_timeout_secs)))
        .timeout_connect(Some(Duration::from_secs(config.connect_timeout_secs)))
        .build()
        .new_agent();

    let mut response = agent
        .get(url)
        .header("User-Agent", &config.user_agent)
        .call()?;

    if response.status() != 200 {
        return Err(CatalogError::Status(response.status().as_u16()));
    }

    let content = response
        .body_mut()
        .with_config()
        .limit(config.playlist_max_bytes)
        .read_to_string()?;
    Ok(content)
}

/// Channel metadata collected from an `#EXTINF:` line, waiting for its
/// stream URL line.
#[derive(Debug)]
struct PendingChannel {
    name: String,
    tvg_id: String,
    logo: Option<String>,
    group: String,
    request_headers: BTreeMap<String, String>,
}

/// Parse one source document into `fetch`, stopping once the global
/// channel cap is reached.
pub fn parse_source(content: &str, source_index: usize, max_channels: usize, fetch: &mut CatalogFetch) {
    // ids from other sources carry a different index suffix, so only this
    // source's ids can collide
    let mut index_of: HashMap<String, usize> = HashMap::new();
    let mut pending: Option<PendingChannel> = None;

    for line in content.lines() {
        let line = line.trim();

        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let channel = parse_extinf(info);
            fetch.genres.insert(channel.group.clone());
            // a metadata line with no display name cannot form a channel;
            // it also clears any earlier pending entry
            pending = (!channel.name.is_empty()).then_some(channel);
        } else if let Some(opt) = line.strip_prefix("#EXTVLCOPT:") {
            if let Some(ref mut channel) = pending {
                apply_vlc_option(opt, &mut channel.request_headers);
            }
        } else if line.is_empty() || line.starts_with('#') {
            continue;
        } else if is_stream_url(line) {
            let Some(channel) = pending.take() else { continue };
            let id = format!("tv|{}_{}", channel.tvg_id, source_index);
            let stream = StreamEntry {
                url: line.to_string(),
                display_name: channel.name.clone(),
                request_headers: channel.request_headers.clone(),
            };
            if let Some(&at) = index_of.get(&id) {
                // same tvg-id within one source: extra stream for the
                // already committed channel, priority by document order
                fetch.channels[at].streams.push(stream);
            } else {
                if fetch.channels.len() >= max_channels {
                    warn!("channel cap {} reached mid-source {}", max_channels, source_index);
                    fetch.truncated = true;
                    return;
                }
                index_of.insert(id.clone(), fetch.channels.len());
                fetch.channels.push(Channel {
                    id,
                    name: channel.name,
                    logo: channel.logo,
                    group: channel.group,
                    tvg_id: channel.tvg_id,
                    source_index,
                    streams: vec![stream],
                });
            }
        }
        // any other non-comment line is junk; the pending channel keeps
        // waiting for its URL line
    }
}

fn parse_extinf(info: &str) -> PendingChannel {
    let mut attrs: HashMap<String, String> = HashMap::new();
    extract_attrs(info, &mut attrs);

    // display name is the text after the last comma
    let name = match info.rfind(',') {
        Some(pos) => info[pos + 1..].trim().to_string(),
        None => String::new(),
    };

    let tvg_id = attrs
        .get("tvg-id")
        .filter(|id| !id.trim().is_empty())
        .map(|id| id.trim().to_string())
        .unwrap_or_else(|| slug(&name));
    let group = attrs
        .get("group-title")
        .filter(|g| !g.trim().is_empty())
        .map(|g| g.trim().to_string())
        .unwrap_or_else(|| DEFAULT_GENRE.to_string());

    PendingChannel {
        name,
        tvg_id,
        logo: attrs.get("tvg-logo").filter(|l| !l.is_empty()).cloned(),
        group,
        request_headers: BTreeMap::new(),
    }
}

/// Extract `key="value"` / `key=value` attributes from an EXTINF line,
/// skipping the leading duration token.
fn extract_attrs(info: &str, attrs: &mut HashMap<String, String>) {
    let mut chars = info.chars().peekable();
    let mut seen_duration = false;

    while chars.peek().is_some() {
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }

        // the first token is the duration, e.g. "-1" or "0.5"
        if !seen_duration {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() || c == '-' || c == '.' {
                    chars.next();
                } else {
                    break;
                }
            }
            seen_duration = true;
            continue;
        }

        let mut key = String::new();
        loop {
            match chars.peek() {
                Some(&'=') => {
                    chars.next();
                    break;
                }
                // a comma before '=' means attributes are done and the
                // rest of the line is the channel name
                Some(&',') | None => return,
                Some(_) => key.push(chars.next().unwrap_or_default()),
            }
        }

        let key = key.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }

        match chars.peek() {
            Some('"') => {
                chars.next();
                let mut value = String::new();
                while let Some(c) = chars.next() {
                    if c == '"' {
                        break;
                    }
                    if c == '\\' && chars.peek() == Some(&'"') {
                        value.push(chars.next().unwrap_or_default());
                        continue;
                    }
                    value.push(c);
                }
                attrs.insert(key, value);
            }
            Some(_) => {
                let mut value = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == ',' {
                        break;
                    }
                    value.push(chars.next().unwrap_or_default());
                }
                if !value.is_empty() {
                    attrs.insert(key, value);
                }
            }
            None => {}
        }
    }
}

/// Map a VLC option line onto an HTTP request header for the pending
/// channel's stream.
fn apply_vlc_option(opt: &str, headers: &mut BTreeMap<String, String>) {
    let Some((key, value)) = opt.split_once('=') else { return };
    let header = match key.trim().to_ascii_lowercase().as_str() {
        "http-user-agent" => "User-Agent",
        "http-referrer" | "http-referer" => "Referer",
        "http-origin" => "Origin",
        _ => return,
    };
    let value = value.trim();
    if !value.is_empty() {
        headers.insert(header.to_string(), value.to_string());
    }
}

fn is_stream_url(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("rtmp://")
        || lower.starts_with("rtmps://")
}

/// Fallback tvg-id derived from the display name: lowercase, alphanumeric
/// runs kept, everything else collapsed to a single `-`.
fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    out
}
