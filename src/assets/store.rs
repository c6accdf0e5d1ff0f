//! Asset deduplication ledger.
//!
//! Assets are deduplicated twice: by absolute URL before any download starts,
//! and by SHA-256 content hash afterwards so mirrored copies of one file land
//! on disk exactly once. A hash collision with a different byte length is an
//! invariant violation and propagates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetStoreError {
    #[error("content hash {hash} maps to two different sizes ({existing} vs {incoming} bytes)")]
    HashCollision {
        hash: String,
        existing: u64,
        incoming: u64,
    },
}

/// Capture record for one downloaded asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub original_url: String,
    pub local_path: String,
    pub content_hash: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

/// In-memory ledger of every asset captured so far.
#[derive(Debug, Default)]
pub struct AssetStore {
    records: Vec<AssetRecord>,
    by_url: HashMap<String, usize>,
    by_hash: HashMap<String, usize>,
}

/// Outcome of committing a downloaded body.
#[derive(Debug, PartialEq)]
pub enum Commit {
    /// First time this content was seen; the caller must write the file.
    New { local_path: String },
    /// Content already on disk under this path.
    Duplicate { local_path: String },
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local path a URL was already captured under, if any.
    pub fn lookup_url(&self, url: &str) -> Option<&AssetRecord> {
        self.by_url.get(url).map(|&i| &self.records[i])
    }

    /// Register a downloaded body for `url`. Duplicate content maps the URL
    /// onto the existing file instead of producing a second copy.
    pub fn commit(
        &mut self,
        url: &str,
        hash: &str,
        extension: &str,
        content_type: Option<String>,
        size_bytes: u64,
    ) -> Result<Commit, AssetStoreError> {
        if let Some(&i) = self.by_hash.get(hash) {
            let existing = &self.records[i];
            if existing.size_bytes != size_bytes {
                return Err(AssetStoreError::HashCollision {
                    hash: hash.to_string(),
                    existing: existing.size_bytes,
                    incoming: size_bytes,
                });
            }
            let local_path = existing.local_path.clone();
            let index = self.records.len();
            self.records.push(AssetRecord {
                original_url: url.to_string(),
                local_path: local_path.clone(),
                content_hash: hash.to_string(),
                content_type,
                size_bytes,
            });
            self.by_url.insert(url.to_string(), index);
            return Ok(Commit::Duplicate { local_path });
        }

        let local_path = format!("assets/{hash}.{extension}");
        let index = self.records.len();
        self.records.push(AssetRecord {
            original_url: url.to_string(),
            local_path: local_path.clone(),
            content_hash: hash.to_string(),
            content_type,
            size_bytes,
        });
        self.by_url.insert(url.to_string(), index);
        self.by_hash.insert(hash.to_string(), index);
        Ok(Commit::New { local_path })
    }

    pub fn records(&self) -> &[AssetRecord] {
        &self.records
    }

    /// Count of distinct files on disk.
    pub fn distinct_files(&self) -> usize {
        self.by_hash.len()
    }
}

/// Preferred file extension for a response content type.
pub fn extension_for(content_type: Option<&str>, url_path: &str) -> String {
    let from_mime = content_type
        .map(|value| value.split(';').next().unwrap_or(value).trim())
        .and_then(|mime| match mime {
            "text/css" => Some("css"),
            "text/javascript" | "application/javascript" | "application/x-javascript" => {
                Some("js")
            }
            "application/json" => Some("json"),
            "text/html" => Some("html"),
            "image/png" => Some("png"),
            "image/jpeg" => Some("jpg"),
            "image/gif" => Some("gif"),
            "image/svg+xml" => Some("svg"),
            "image/webp" => Some("webp"),
            "image/x-icon" | "image/vnd.microsoft.icon" => Some("ico"),
            "font/woff2" | "application/font-woff2" => Some("woff2"),
            "font/woff" | "application/font-woff" => Some("woff"),
            "font/ttf" | "application/x-font-ttf" => Some("ttf"),
            "video/mp4" => Some("mp4"),
            "video/webm" => Some("webm"),
            "application/pdf" => Some("pdf"),
            _ => None,
        });
    if let Some(ext) = from_mime {
        return ext.to_string();
    }

    // Fall back to the URL path extension when the mime type is unknown.
    let from_path = url_path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        });
    from_path.unwrap_or("bin").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_content_shares_one_file() {
        let mut store = AssetStore::new();
        let first = store
            .commit("https://a.test/logo.png", "abc123", "png", None, 10)
            .unwrap();
        let second = store
            .commit("https://cdn.a.test/logo.png", "abc123", "png", None, 10)
            .unwrap();

        assert_eq!(
            first,
            Commit::New {
                local_path: "assets/abc123.png".into()
            }
        );
        assert_eq!(
            second,
            Commit::Duplicate {
                local_path: "assets/abc123.png".into()
            }
        );
        assert_eq!(store.records().len(), 2);
        assert_eq!(store.distinct_files(), 1);
        assert!(store.lookup_url("https://cdn.a.test/logo.png").is_some());
    }

    #[test]
    fn size_mismatch_on_equal_hash_is_a_collision() {
        let mut store = AssetStore::new();
        store
            .commit("https://a.test/x", "abc123", "bin", None, 10)
            .unwrap();
        let result = store.commit("https://a.test/y", "abc123", "bin", None, 11);
        assert!(matches!(
            result,
            Err(AssetStoreError::HashCollision { .. })
        ));
    }

    #[test]
    fn extension_prefers_mime_over_path() {
        assert_eq!(extension_for(Some("text/css"), "/style.php"), "css");
        assert_eq!(
            extension_for(Some("image/jpeg; charset=binary"), "/photo"),
            "jpg"
        );
        assert_eq!(extension_for(None, "/fonts/icons.woff2"), "woff2");
        assert_eq!(extension_for(None, "/api/resource"), "bin");
        assert_eq!(extension_for(Some("application/octet-stream"), "/a.PNG"), "png");
    }
}
