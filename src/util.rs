use url::Url;

const MAX_FILENAME_CHARS: usize = 200;
const RESERVED: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

const WATCH_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];
const SHORT_HOSTS: &[&str] = &["youtu.be", "www.youtu.be"];

fn is_media_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn canonical_watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

/// Rewrite known watch and short-link URLs to `https://www.youtube.com/watch?v=<id>`,
/// dropping playlist, timestamp and tracking parameters. Anything else is returned as-is.
pub fn normalize_url(raw: &str) -> String {
    let parsed = match Url::parse(raw.trim()) {
        Ok(u) => u,
        Err(_) => return raw.to_string(),
    };
    let host = match parsed.host_str() {
        Some(h) => h.to_ascii_lowercase(),
        None => return raw.to_string(),
    };

    if WATCH_HOSTS.contains(&host.as_str()) {
        let id = parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned());
        if let Some(id) = id.filter(|id| is_media_id(id)) {
            return canonical_watch_url(&id);
        }
    } else if SHORT_HOSTS.contains(&host.as_str()) {
        let id = parsed
            .path_segments()
            .and_then(|mut segs| segs.next())
            .unwrap_or("");
        if is_media_id(id) {
            return canonical_watch_url(id);
        }
    }

    raw.to_string()
}

/// Make a title safe to use as a download filename: reserved and control
/// characters become `_`, surrounding whitespace is trimmed and the result
/// is capped at 200 characters. May return an empty string.
pub fn sanitize_filename(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| {
            if RESERVED.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let truncated: String = replaced.trim().chars().take(MAX_FILENAME_CHARS).collect();
    // Truncation can expose trailing whitespace.
    truncated.trim_end().to_string()
}
