//! Stable cache keys for playback requests, and the placeholder titles given
//! to entries whose real title has not been looked up yet.

use regex::Regex;
use std::sync::OnceLock;

/// Title given to freshly enqueued entries.
pub const LOADING_TITLE: &str = "Loading...";

/// Title used when a lookup came back but had nothing to show.
pub const UNKNOWN_TITLE: &str = "Unknown title";

const PLACEHOLDER_TITLES: &[&str] = &[LOADING_TITLE, UNKNOWN_TITLE];

/// True when `title` still needs a metadata lookup.
pub fn is_placeholder_title(title: &str) -> bool {
    let title = title.trim();
    title.is_empty() || PLACEHOLDER_TITLES.contains(&title)
}

/// True when the request is a direct link rather than a search query.
pub fn is_url(query: &str) -> bool {
    let q = query.trim();
    q.starts_with("https://") || q.starts_with("http://")
}

fn youtube_id_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:youtube\.com/(?:watch\?(?:[^#]*&)?v=|shorts/|embed/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})",
        )
        .ok()
    })
    .as_ref()
}

/// Extracts the cache key for a URL or query.
///
/// YouTube links (any of the common shapes) map to their 11-character video
/// id so that different links to the same video share one cached file.
/// Anything else maps to `url-<hash>` of the trimmed input.
pub fn resource_id(url: &str) -> String {
    let url = url.trim();
    if let Some(id) = youtube_id_regex()
        .and_then(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
    {
        return id.as_str().to_string();
    }
    format!("url-{:016x}", fnv1a64(url.as_bytes()))
}

// The key is persisted in the cache index, so it must not depend on the
// std hasher, whose output may change between releases.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
