//! Channel lineup: slug → declared stream endpoint.
//!
//! Loaded from the bouquet playlist. The map is read-mostly; a lookup miss
//! triggers one reload so freshly added channels resolve without a restart.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::Result;

/// One channel from the playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelEntry {
    pub tvg_id: String,
    pub name: String,
    /// Declared stream endpoint; may still need resolution via the web API.
    pub url: String,
}

/// Derive a URL-safe slug from a channel name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Parse an M3U playlist into channel entries.
///
/// Only the fields the gateway needs: `tvg-id`, the display name after the
/// last comma of `#EXTINF`, and the following URL line.
pub fn parse_playlist(text: &str) -> Vec<ChannelEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<(String, String)> = None;

    for line in text.lines() {
        let line = line.trim();

        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let tvg_id = attribute(info, "tvg-id").unwrap_or_default();
            let name = info
                .rsplit_once(',')
                .map(|(_, n)| n.trim().to_string())
                .unwrap_or_default();
            pending = Some((tvg_id, name));
        } else if !line.is_empty() && !line.starts_with('#') {
            if let Some((tvg_id, name)) = pending.take() {
                entries.push(ChannelEntry {
                    tvg_id,
                    name,
                    url: line.to_string(),
                });
            }
        }
    }

    entries
}

fn attribute(line: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=\"");
    let start = line.find(&needle)? + needle.len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Slug-keyed channel map with reload-on-miss.
pub struct ChannelMap {
    playlist_path: PathBuf,
    inner: RwLock<HashMap<String, ChannelEntry>>,
}

impl ChannelMap {
    pub fn new(playlist_path: PathBuf) -> Self {
        Self {
            playlist_path,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Load (or reload) the playlist from disk.
    pub fn reload(&self) -> Result<usize> {
        let text = std::fs::read_to_string(&self.playlist_path)?;
        let entries = parse_playlist(&text);

        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            map.insert(slugify(&entry.name), entry);
        }

        let count = map.len();
        *self.inner.write() = map;
        debug!(
            path = %self.playlist_path.display(),
            channels = count,
            "channel map loaded"
        );
        Ok(count)
    }

    /// Look up a channel by slug; one reload retry on miss.
    pub fn lookup(&self, slug: &str) -> Option<ChannelEntry> {
        if let Some(entry) = self.inner.read().get(slug) {
            return Some(entry.clone());
        }

        if let Err(e) = self.reload() {
            warn!(error = %e, "channel map reload failed");
            return None;
        }

        self.inner.read().get(slug).cloned()
    }

    /// True when the slug names a known channel (no reload).
    pub fn contains(&self, slug: &str) -> bool {
        self.inner.read().contains_key(slug)
    }

    /// Snapshot of all entries, sorted by name.
    pub fn entries(&self) -> Vec<ChannelEntry> {
        let mut entries: Vec<_> = self.inner.read().values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Path of the backing playlist file.
    pub fn playlist_path(&self) -> &std::path::Path {
        &self.playlist_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PLAYLIST: &str = "#EXTM3U\n\
        #EXTINF:-1 tvg-id=\"Das Erste.de\",Das Erste HD\n\
        http://receiver.lan:8001/1:0:19:283D:3FB:1:C00000:0:0:0:\n\
        #EXTINF:-1 tvg-id=\"zdf.de\",ZDF HD\n\
        http://receiver.lan:8001/1:0:19:2B66:3F3:1:C00000:0:0:0:\n";

    #[test]
    fn slugify_flattens_names() {
        assert_eq!(slugify("Das Erste HD"), "das-erste-hd");
        assert_eq!(slugify("  ZDF  HD  "), "zdf-hd");
        assert_eq!(slugify("Pro7 MAXX!"), "pro7-maxx");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn parses_playlist_entries() {
        let entries = parse_playlist(PLAYLIST);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Das Erste HD");
        assert_eq!(entries[0].tvg_id, "Das Erste.de");
        assert!(entries[0].url.contains("1:0:19:283D"));
    }

    #[test]
    fn url_without_extinf_is_skipped() {
        let entries = parse_playlist("#EXTM3U\nhttp://orphan.example/1\n");
        assert!(entries.is_empty());
    }

    #[test]
    fn lookup_reloads_on_miss() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "#EXTM3U\n").unwrap();
        file.flush().unwrap();

        let map = ChannelMap::new(file.path().to_path_buf());
        map.reload().unwrap();
        assert!(map.lookup("das-erste-hd").is_none());

        // Channel appears on disk; the next miss triggers a reload.
        write!(file, "{}", &PLAYLIST["#EXTM3U\n".len()..]).unwrap();
        file.flush().unwrap();

        let entry = map.lookup("das-erste-hd").expect("found after reload");
        assert_eq!(entry.name, "Das Erste HD");
        assert_eq!(map.len(), 2);
    }
}
