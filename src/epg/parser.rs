//! XMLTV guide fetching and parsing
//!
//! Guide documents run into tens of megabytes and often arrive
//! gzip-compressed, so the download is streamed through the decompressor
//! under three independent ceilings: transferred bytes, decompressed
//! bytes, and an overall wall-clock deadline. Crossing any of them
//! discards the whole document; a truncated guide is never parsed.

use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use log::{debug, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::{GuideIndex, ProgrammeEntry};
use crate::config::CoreConfig;
use crate::error::CatalogError;
use crate::url_norm;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const CHUNK_SIZE: usize = 64 * 1024;

/// Fetch and parse an XMLTV document. The URL may itself be percent-encoded
/// one or more times. Any failure - network, size, deadline, malformed
/// XML - is logged and reported as unavailable, never as an error to the
/// caller.
pub fn fetch_guide(raw_url: &str, config: &CoreConfig) -> Option<GuideIndex> {
    let url = url_norm::fully_decode(raw_url);
    let url = url.trim();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        warn!("guide URL is not absolute http(s): {:?}", raw_url);
        return None;
    }

    match download_and_parse(url, config) {
        Ok(index) => {
            debug!(
                "guide parsed: {} programmes across {} channels",
                index.programme_count(),
                index.channel_count()
            );
            Some(index)
        }
        Err(e) => {
            warn!("guide unavailable ({}): {}", url, e);
            None
        }
    }
}

fn download_and_parse(url: &str, config: &CoreConfig) -> Result<GuideIndex, CatalogError> {
    let deadline = Instant::now() + Duration::from_secs(config.guide_deadline_secs);

    let agent = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(config.fetch_timeout_secs)))
        .timeout_connect(Some(Duration::from_secs(config.connect_timeout_secs)))
        .build()
        .new_agent();

    // cheap size probe before committing to the body; a failed HEAD is
    // ignored since the streaming caps below still hold
    if let Some(declared) = declared_content_length(&agent, url, config) {
        if declared > config.guide_max_compressed_bytes {
            return Err(CatalogError::Oversized {
                size: declared,
                limit: config.guide_max_compressed_bytes,
            });
        }
    }

    let response = agent
        .get(url)
        .header("User-Agent", &config.user_agent)
        .call()?;
    if response.status() != 200 {
        return Err(CatalogError::Status(response.status().as_u16()));
    }

    let body = read_capped(response.into_body().into_reader(), config, deadline)?;
    parse_xmltv(&body, deadline)
}

fn declared_content_length(agent: &ureq::Agent, url: &str, config: &CoreConfig) -> Option<u64> {
    let response = agent
        .head(url)
        .header("User-Agent", &config.user_agent)
        .call()
        .ok()?;
    response
        .headers()
        .get("Content-Length")?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Wire-byte counter that turns a lying Content-Length into a hard stop.
struct CountingReader<R> {
    inner: R,
    read: u64,
    limit: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        if self.read > self.limit {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "transferred size exceeds guide ceiling",
            ));
        }
        Ok(n)
    }
}

/// Read the whole (possibly gzipped) body into memory, enforcing the
/// decompressed-size ceiling and the overall deadline per chunk. Returning
/// an error drops the reader, which cancels the transfer; nothing partial
/// survives.
fn read_capped<R: Read>(
    reader: R,
    config: &CoreConfig,
    deadline: Instant,
) -> Result<Vec<u8>, CatalogError> {
    let mut raw = CountingReader {
        inner: reader,
        read: 0,
        limit: config.guide_max_compressed_bytes,
    };

    // sniff the gzip magic instead of trusting extensions or headers
    let mut magic = [0u8; 2];
    let sniffed = read_magic(&mut raw, &mut magic)?;
    let prefix = &magic[..sniffed];

    if sniffed == 2 && magic == GZIP_MAGIC {
        accumulate(GzDecoder::new(prefix.chain(raw)), config, deadline)
    } else {
        accumulate(prefix.chain(raw), config, deadline)
    }
}

fn read_magic<R: Read>(reader: &mut R, magic: &mut [u8; 2]) -> Result<usize, CatalogError> {
    let mut filled = 0;
    while filled < magic.len() {
        match reader.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn accumulate<R: Read>(
    mut reader: R,
    config: &CoreConfig,
    deadline: Instant,
) -> Result<Vec<u8>, CatalogError> {
    let mut out = Vec::with_capacity(CHUNK_SIZE);
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        if Instant::now() >= deadline {
            return Err(CatalogError::Deadline);
        }
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let next = out.len() as u64 + n as u64;
                if next > config.guide_max_decompressed_bytes {
                    return Err(CatalogError::Oversized {
                        size: next,
                        limit: config.guide_max_decompressed_bytes,
                    });
                }
                out.extend_from_slice(&chunk[..n]);
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Root,
    Programme,
    Title,
    Desc,
}

/// Streaming XMLTV parse. Unlike the playlist parser this is
/// all-or-nothing: a structural XML error fails the whole document, so a
/// half-parsed guide can never shadow a complete previous one. Entries
/// with missing or unparsable time bounds are dropped, never defaulted.
pub fn parse_xmltv(bytes: &[u8], deadline: Instant) -> Result<GuideIndex, CatalogError> {
    let mut xml_reader = Reader::from_reader(bytes);
    xml_reader.config_mut().trim_text(true);

    let mut index = GuideIndex::default();
    let mut buf = Vec::with_capacity(8192);

    let mut state = ParserState::Root;
    let mut channel = String::new();
    let mut bounds: Option<(i64, i64)> = None;
    let mut title = String::new();
    let mut description = String::new();
    let mut events = 0usize;

    loop {
        events += 1;
        if events % 4096 == 0 && Instant::now() >= deadline {
            return Err(CatalogError::Deadline);
        }

        let position = xml_reader.buffer_position();
        match xml_reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"programme" => {
                    state = ParserState::Programme;
                    channel = get_attribute(e, b"channel").unwrap_or_default();
                    let start = get_attribute(e, b"start").and_then(|s| parse_xmltv_time(&s));
                    let stop = get_attribute(e, b"stop").and_then(|s| parse_xmltv_time(&s));
                    bounds = start.zip(stop);
                    title.clear();
                    description.clear();
                }
                b"title" if state == ParserState::Programme => state = ParserState::Title,
                b"desc" if state == ParserState::Programme => state = ParserState::Desc,
                _ => {}
            },
            Ok(Event::Text(ref e)) => match state {
                ParserState::Title | ParserState::Desc => {
                    let text = decode_xml_entities(&String::from_utf8_lossy(e.as_ref()));
                    if state == ParserState::Title {
                        title.push_str(&text);
                    } else {
                        description.push_str(&text);
                    }
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"programme" => {
                    if let Some((start, stop)) = bounds.take() {
                        if !channel.is_empty() && !title.trim().is_empty() {
                            let desc = description.trim();
                            index.insert(ProgrammeEntry {
                                channel: std::mem::take(&mut channel),
                                title: title.trim().to_string(),
                                description: (!desc.is_empty()).then(|| desc.to_string()),
                                start,
                                stop,
                            });
                        }
                    }
                    state = ParserState::Root;
                }
                b"title" if state == ParserState::Title => state = ParserState::Programme,
                b"desc" if state == ParserState::Desc => state = ParserState::Programme,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(CatalogError::Malformed(format!(
                    "XML error at byte {}: {}",
                    position, e
                )));
            }
        }
        buf.clear();
    }

    Ok(index)
}

fn get_attribute(e: &BytesStart, name: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            let raw = String::from_utf8(attr.value.as_ref().to_vec()).ok()?;
            return Some(decode_xml_entities(&raw));
        }
    }
    None
}

/// Decode the named and numeric XML entities that show up in real guide
/// text without failing on the nonstandard ones.
fn decode_xml_entities(s: &str) -> String {
    let mut result = s.to_string();

    result = result.replace("&amp;", "&");
    result = result.replace("&lt;", "<");
    result = result.replace("&gt;", ">");
    result = result.replace("&quot;", "\"");
    result = result.replace("&apos;", "'");
    result = result.replace("&nbsp;", " ");

    while let Some(start) = result.find("&#") {
        let Some(end) = result[start..].find(';') else { break };
        let entity = result[start..start + end + 1].to_string();
        let num = &entity[2..entity.len() - 1];
        let code = if let Some(hex) = num.strip_prefix(['x', 'X']) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            num.parse::<u32>().ok()
        };
        match code.and_then(char::from_u32) {
            Some(c) => result = result.replace(&entity, &c.to_string()),
            None => break,
        }
    }

    result
}

/// Parse an XMLTV timestamp: a 14-digit `YYYYMMDDHHMMSS` prefix with an
/// optional `±HHMM` zone suffix. Anything shorter or non-numeric is
/// unparsable and yields `None`.
fn parse_xmltv_time(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let digits = raw.get(..14)?;
    let naive = NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()?;
    let offset = raw.get(14..).map(parse_tz_offset).unwrap_or(0);
    Some(naive.and_utc().timestamp() - offset)
}

/// Zone suffix like `"+0100"` or `"-0530"` to seconds; unrecognized
/// suffixes count as UTC.
fn parse_tz_offset(raw: &str) -> i64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0;
    }
    let sign = if raw.starts_with('-') { -1 } else { 1 };
    let digits = raw.trim_start_matches(['+', '-']);
    let hours: i64 = digits.get(0..2).and_then(|s| s.parse().ok()).unwrap_or(0);
    let minutes: i64 = digits.get(2..4).and_then(|s| s.parse().ok()).unwrap_or(0);
    sign * (hours * 3600 + minutes * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn parse(xml: &str) -> GuideIndex {
        parse_xmltv(xml.as_bytes(), far_deadline()).unwrap()
    }

    #[test]
    fn test_parse_xmltv_time() {
        let utc = parse_xmltv_time("20240101120000 +0000").unwrap();
        assert_eq!(utc, 1704110400); // 2024-01-01T12:00:00Z

        let plus_one = parse_xmltv_time("20240101120000 +0100").unwrap();
        assert_eq!(utc - plus_one, 3600);

        let no_zone = parse_xmltv_time("20240101120000").unwrap();
        assert_eq!(no_zone, utc);
    }

    #[test]
    fn test_unparsable_time_is_none() {
        assert!(parse_xmltv_time("").is_none());
        assert!(parse_xmltv_time("2024010112").is_none());
        assert!(parse_xmltv_time("2024state120000").is_none());
        assert!(parse_xmltv_time("notadate").is_none());
    }

    #[test]
    fn test_parse_simple_guide() {
        let index = parse(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <programme channel="bbc1" start="20240101120000 +0000" stop="20240101130000 +0000">
    <title>News</title>
    <desc>Lunchtime news</desc>
  </programme>
</tv>"#,
        );

        assert_eq!(index.programme_count(), 1);
        // 12:30 UTC is inside the window, 13:30 is not
        assert!(index.now_playing("bbc1", 1704112200).is_some());
        assert!(index.now_playing("bbc1", 1704115800).is_none());
        let entry = index.now_playing("bbc1", 1704112200).unwrap();
        assert_eq!(entry.title, "News");
        assert_eq!(entry.description.as_deref(), Some("Lunchtime news"));
    }

    #[test]
    fn test_single_programme_equals_list_of_one() {
        let single = parse(
            r#"<tv><programme channel="c" start="20240101000000" stop="20240101010000"><title>A</title></programme></tv>"#,
        );
        let listed = parse(
            r#"<tv>
<programme channel="c" start="20240101000000" stop="20240101010000"><title>A</title></programme>
<programme channel="c" start="20240101010000" stop="20240101020000"><title>B</title></programme>
</tv>"#,
        );
        assert_eq!(single.programme_count(), 1);
        assert_eq!(listed.programme_count(), 2);
    }

    #[test]
    fn test_entries_with_bad_bounds_are_dropped() {
        let index = parse(
            r#"<tv>
<programme channel="c" start="garbage" stop="20240101010000"><title>Bad start</title></programme>
<programme channel="c" stop="20240101010000"><title>No start</title></programme>
<programme channel="c" start="20240101000000" stop="20240101010000"><title>Good</title></programme>
</tv>"#,
        );
        assert_eq!(index.programme_count(), 1);
        assert_eq!(index.now_playing("c", 1704067260).unwrap().title, "Good");
    }

    #[test]
    fn test_structural_error_fails_whole_document() {
        let result = parse_xmltv(
            br#"<tv><programme channel="c" start="20240101000000" stop="20240101010000"><title>A</title></tv>"#,
            far_deadline(),
        );
        assert!(matches!(result, Err(CatalogError::Malformed(_))));
    }

    #[test]
    fn test_entity_decoding_in_title() {
        let index = parse(
            r#"<tv><programme channel="c" start="20240101000000" stop="20240101010000"><title>Tom &amp; Jerry &#233;</title></programme></tv>"#,
        );
        let entry = index.now_playing("c", 1704067260).unwrap();
        assert_eq!(entry.title, "Tom & Jerry \u{e9}");
    }

    #[test]
    fn test_accumulate_respects_decompressed_ceiling() {
        let config = CoreConfig {
            guide_max_decompressed_bytes: 1024,
            ..CoreConfig::default()
        };
        let big = vec![b'x'; 4096];
        let result = read_capped(&big[..], &config, far_deadline());
        assert!(matches!(result, Err(CatalogError::Oversized { .. })));
    }

    #[test]
    fn test_read_capped_inflates_gzip_stream() {
        let xml = br#"<tv><programme channel="c" start="20240101000000" stop="20240101010000"><title>A</title></programme></tv>"#;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(xml).unwrap();
        let gz = encoder.finish().unwrap();

        let config = CoreConfig::default();
        let body = read_capped(&gz[..], &config, far_deadline()).unwrap();
        assert_eq!(body, xml);

        let index = parse_xmltv(&body, far_deadline()).unwrap();
        assert_eq!(index.programme_count(), 1);
    }

    #[test]
    fn test_gzip_bomb_hits_ceiling_not_memory() {
        // 8MB of zeros compresses to a few KB; the decompressed cap must
        // stop inflation long before 8MB lands in the buffer
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&vec![0u8; 8 * 1024 * 1024]).unwrap();
        let gz = encoder.finish().unwrap();

        let config = CoreConfig {
            guide_max_decompressed_bytes: 256 * 1024,
            ..CoreConfig::default()
        };
        let result = read_capped(&gz[..], &config, far_deadline());
        assert!(matches!(result, Err(CatalogError::Oversized { .. })));
    }

    #[test]
    fn test_deadline_aborts_accumulation() {
        let config = CoreConfig::default();
        let body = vec![b'x'; 1024];
        let expired = Instant::now() - Duration::from_secs(1);
        let result = read_capped(&body[..], &config, expired);
        assert!(matches!(result, Err(CatalogError::Deadline)));
    }
}
