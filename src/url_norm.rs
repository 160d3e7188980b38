//! Source URL normalization
//!
//! Playlist URLs arrive from configuration round-trips percent-encoded one
//! or more times, comma-separated, and sometimes carrying control
//! parameters the configuration form appended to the real URL. This module
//! reduces that mess to a clean list of absolute HTTP(S) URLs.

use std::sync::OnceLock;

use regex::Regex;

/// Upper bound on the repeated-decode loop so adversarial input cannot
/// keep it spinning; the fixed-point check usually exits far earlier.
const MAX_DECODE_PASSES: usize = 5;

fn control_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[?&](?:epg|language|update_interval|epg_enabled)=[^&,\s]*")
            .expect("control parameter pattern is valid")
    })
}

/// Percent-decode until a fixed point is reached, up to [`MAX_DECODE_PASSES`].
/// A decode failure keeps the last successfully decoded value instead of
/// aborting, so a lone stray `%` never loses the whole URL.
pub fn fully_decode(raw: &str) -> String {
    let mut current = raw.to_string();
    for _ in 0..MAX_DECODE_PASSES {
        match urlencoding::decode(&current) {
            Ok(decoded) => {
                if decoded == current {
                    break;
                }
                current = decoded.into_owned();
            }
            Err(_) => break,
        }
    }
    current
}

/// Normalize a raw, possibly multiply-encoded, comma-separated URL list
/// into absolute HTTP(S) URLs. Idempotent: running it over its own output
/// returns the same list.
pub fn normalize_source_urls(raw: &str) -> Vec<String> {
    let decoded = fully_decode(raw).replace("&amp;", "&");
    decoded
        .split(',')
        .map(|entry| strip_control_params(entry.trim()))
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .collect()
}

/// Remove the control parameters the configuration form embeds into the
/// playlist URL (`epg`, `language`, `update_interval`, `epg_enabled`) and
/// tidy up whatever query-string punctuation that leaves behind.
fn strip_control_params(url: &str) -> String {
    let stripped = control_param_re().replace_all(url, "");
    // stripping "?epg=..." may orphan the next parameter behind a '&'
    let mut cleaned = match (stripped.find('?'), stripped.find('&')) {
        (None, Some(pos)) => {
            let mut s = stripped.into_owned();
            s.replace_range(pos..pos + 1, "?");
            s
        }
        _ => stripped.into_owned(),
    };
    while cleaned.ends_with('?') || cleaned.ends_with('&') {
        cleaned.pop();
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_url_passes_through() {
        let urls = normalize_source_urls("http://example.com/playlist.m3u");
        assert_eq!(urls, vec!["http://example.com/playlist.m3u"]);
    }

    #[test]
    fn test_single_and_double_encoding_reach_same_fixed_point() {
        let plain = "http://example.com/a.m3u?user=x&pass=y";
        let once = urlencoding::encode(plain).into_owned();
        let twice = urlencoding::encode(&once).into_owned();

        let from_once = normalize_source_urls(&once);
        let from_twice = normalize_source_urls(&twice);
        assert_eq!(from_once, vec![plain.to_string()]);
        assert_eq!(from_once, from_twice);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let raw = "http%253A%252F%252Fa.example%252Fx.m3u%3Fepg%3D1,https://b.example/y.m3u?language=en&user=1";
        let first = normalize_source_urls(raw);
        let second = normalize_source_urls(&first.join(","));
        assert_eq!(first, second);
    }

    #[test]
    fn test_strips_all_control_params() {
        let urls = normalize_source_urls(
            "http://h/p.m3u?epg=http://e/guide.xml&language=en&update_interval=02:00&epg_enabled=true",
        );
        assert_eq!(urls, vec!["http://h/p.m3u"]);
    }

    #[test]
    fn test_keeps_real_params_when_control_param_led_the_query() {
        let urls = normalize_source_urls("http://h/p.m3u?epg=x&username=u&password=p");
        assert_eq!(urls, vec!["http://h/p.m3u?username=u&password=p"]);
    }

    #[test]
    fn test_html_entity_ampersands_are_folded() {
        let urls = normalize_source_urls("http://h/p.m3u?a=1&amp;b=2");
        assert_eq!(urls, vec!["http://h/p.m3u?a=1&b=2"]);
    }

    #[test]
    fn test_comma_separated_list_and_junk_entries() {
        let urls = normalize_source_urls(
            " http://a/one.m3u , https://b/two.m3u , ftp://c/three.m3u , not a url ,",
        );
        assert_eq!(urls, vec!["http://a/one.m3u", "https://b/two.m3u"]);
    }

    #[test]
    fn test_decode_failure_keeps_last_good_value() {
        // "%zz" is not a valid escape; the raw value should survive as-is
        let decoded = fully_decode("http://h/p%zz.m3u");
        assert_eq!(decoded, "http://h/p%zz.m3u");
    }

    #[test]
    fn test_decode_loop_terminates_on_adversarial_nesting() {
        let mut url = "http://example.com/deep.m3u".to_string();
        for _ in 0..12 {
            url = urlencoding::encode(&url).into_owned();
        }
        // more encoding levels than passes: must terminate, not loop
        let urls = normalize_source_urls(&url);
        assert!(urls.len() <= 1);
    }
}
