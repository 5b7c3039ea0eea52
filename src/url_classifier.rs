//! Recognize supported short-video platforms in a URL and normalize it to a
//! stable dedup key.

use url::Url;

const TRACKING_QUERY_KEYS: [&str; 3] = ["si", "feature", "igshid"];
const TRAILING_PUNCTUATION: [char; 8] = [')', '.', ',', ';', '!', '?', '"', '\''];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Tiktok,
    Instagram,
    X,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Tiktok => write!(f, "tiktok"),
            Platform::Instagram => write!(f, "instagram"),
            Platform::X => write!(f, "x"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedUrl {
    pub input_url: String,
    pub normalized_url: String,
    pub platform: Platform,
}

fn clean_candidate(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c| TRAILING_PUNCTUATION.contains(&c))
        .to_string()
}

fn normalize_host(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    if path == "/" {
        return "/".to_string();
    }
    let stripped = path.trim_end_matches('/');
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

fn normalized_query(parsed: &Url) -> String {
    let mut kept: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(key, _)| {
            let lower_key = key.to_ascii_lowercase();
            !lower_key.starts_with("utm_") && !TRACKING_QUERY_KEYS.contains(&lower_key.as_str())
        })
        .collect();
    kept.sort_by(|(ak, av), (bk, bv)| ak.cmp(bk).then_with(|| av.cmp(bv)));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &kept {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn classify_platform(host: &str, path: &str) -> Option<Platform> {
    if host.ends_with("tiktok.com") {
        return Some(Platform::Tiktok);
    }
    if host.ends_with("instagram.com") {
        let lowered = path.to_ascii_lowercase();
        if lowered.contains("/reel/") || lowered.contains("/p/") || lowered.contains("/tv/") {
            return Some(Platform::Instagram);
        }
        return None;
    }
    if matches!(host, "x.com" | "twitter.com" | "mobile.twitter.com") && is_status_path(path) {
        return Some(Platform::X);
    }
    None
}

// Matches `^/[^/]+/status/\d+` case-insensitively: a non-empty, slash-free
// username segment, the literal "status", then a segment starting with a digit.
fn is_status_path(path: &str) -> bool {
    let mut segments = path.splitn(4, '/');
    let Some(leading) = segments.next() else {
        return false;
    };
    if !leading.is_empty() {
        return false;
    }
    let Some(username) = segments.next() else {
        return false;
    };
    if username.is_empty() {
        return false;
    }
    let Some(status_literal) = segments.next() else {
        return false;
    };
    if !status_literal.eq_ignore_ascii_case("status") {
        return false;
    }
    segments
        .next()
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_digit())
}

/// Classify a single URL, returning `None` for anything unsupported.
pub fn classify(raw: &str) -> Option<ExtractedUrl> {
    let cleaned = clean_candidate(raw);
    let parsed = Url::parse(&cleaned).ok()?;
    if !matches!(parsed.scheme().to_ascii_lowercase().as_str(), "http" | "https") {
        return None;
    }

    let host = normalize_host(parsed.host_str()?);
    let path = normalize_path(parsed.path());
    let platform = classify_platform(&host, &path)?;

    let query = normalized_query(&parsed);
    let normalized_url = if query.is_empty() {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}{path}?{query}")
    };

    Some(ExtractedUrl {
        input_url: cleaned,
        normalized_url,
        platform,
    })
}

/// Scan free-form text for supported URLs, in order of first appearance,
/// deduplicated by `normalized_url`.
pub fn extract_from_text(text: &str) -> Vec<ExtractedUrl> {
    let mut items = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for candidate in find_url_candidates(text) {
        let Some(item) = classify(candidate) else {
            continue;
        };
        if seen.insert(item.normalized_url.clone()) {
            items.push(item);
        }
    }
    items
}

fn find_url_candidates(text: &str) -> Vec<&str> {
    let lower = text.to_ascii_lowercase();
    let mut out = Vec::new();
    let mut pos = 0usize;

    while pos <= lower.len() {
        let next_http = lower[pos..].find("http://").map(|i| i + pos);
        let next_https = lower[pos..].find("https://").map(|i| i + pos);
        let Some(idx) = next_http.into_iter().chain(next_https).min() else {
            break;
        };

        let end = text[idx..]
            .find(char::is_whitespace)
            .map_or(text.len(), |off| idx + off);
        out.push(&text[idx..end]);
        pos = end + 1;
    }

    out
}

/// Deduplicate a list of raw URL strings by classifying each and keeping the
/// first occurrence per normalized URL. Used by the Enqueue API, which
/// receives an explicit URL list rather than free-form text.
pub fn classify_unique(urls: &[String]) -> Vec<ExtractedUrl> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for raw in urls {
        let Some(item) = classify(raw) else {
            continue;
        };
        if seen.insert(item.normalized_url.clone()) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_hosts() {
        assert!(classify("https://www.youtube.com/watch?v=abc").is_none());
        assert!(classify("not a url at all").is_none());
        assert!(classify("ftp://tiktok.com/@someone/video/123").is_none());
    }

    #[test]
    fn classifies_tiktok() {
        let item = classify("https://www.tiktok.com/@someone/video/123").unwrap();
        assert_eq!(item.platform, Platform::Tiktok);
        assert_eq!(item.normalized_url, "https://tiktok.com/@someone/video/123");
    }

    #[test]
    fn classifies_instagram_reel_and_strips_tracking_params() {
        let item = classify("https://instagram.com/reel/ABC123/?igshid=xyz").unwrap();
        assert_eq!(item.platform, Platform::Instagram);
        assert_eq!(item.normalized_url, "https://instagram.com/reel/ABC123");
    }

    #[test]
    fn instagram_requires_known_path_segment() {
        assert!(classify("https://instagram.com/explore/tags/cats/").is_none());
    }

    #[test]
    fn classifies_x_status_across_known_hosts() {
        for host in ["x.com", "twitter.com", "mobile.twitter.com"] {
            let url = format!("https://{host}/someuser/status/12345");
            let item = classify(&url).unwrap();
            assert_eq!(item.platform, Platform::X);
        }
        assert!(classify("https://x.com/someuser/likes").is_none());
    }

    #[test]
    fn normalization_sorts_and_filters_query_keys() {
        let item = classify(
            "HTTPS://WWW.TikTok.com/@a/video/1?z=2&utm_source=app&a=1&si=dropped",
        )
        .unwrap();
        assert_eq!(item.normalized_url, "https://tiktok.com/@a/video/1?a=1&z=2");
    }

    #[test]
    fn extract_from_text_dedupes_and_cleans_trailing_punctuation() {
        let items = extract_from_text(
            "Try (https://instagram.com/p/ABC123/?utm_campaign=x). Also https://instagram.com/p/ABC123/!",
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].normalized_url, "https://instagram.com/p/ABC123");
    }

    #[test]
    fn extract_from_text_preserves_order_of_first_appearance() {
        let items = extract_from_text(
            "first https://x.com/a/status/1 then https://tiktok.com/@b/video/2",
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].platform, Platform::X);
        assert_eq!(items[1].platform, Platform::Tiktok);
    }
}
