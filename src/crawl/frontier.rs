//! Breadth-first URL frontier with visited-set deduplication.
//!
//! Normalization collapses URLs that differ only by fragment or trailing
//! slash so the visited set never holds duplicates of the same page.

use std::collections::{HashSet, VecDeque};

use url::Url;

/// Normalize a URL for visited-set membership: drop the fragment, lowercase
/// the host, and strip a trailing slash from non-root paths.
pub fn normalize_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    if let Some(host) = normalized.host_str() {
        let lowered = host.to_lowercase();
        if lowered != host {
            // set_host only fails on cannot-be-a-base URLs, which never
            // carry a host string in the first place.
            let _ = normalized.set_host(Some(&lowered));
        }
    }

    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(path.trim_end_matches('/'));
    }

    normalized
}

/// Queue entry pairing a URL with its discovery depth.
#[derive(Debug, Clone)]
pub struct FrontierEntry {
    pub url: Url,
    pub depth: usize,
}

/// FIFO frontier of discovered-but-unvisited URLs.
///
/// Owned exclusively by the orchestrator. The visited set never shrinks
/// during a job.
#[derive(Debug, Default)]
pub struct Frontier {
    queue: VecDeque<FrontierEntry>,
    visited: HashSet<String>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a URL unless its normalized form was already seen. Returns
    /// `true` when the URL was accepted.
    pub fn push(&mut self, url: &Url, depth: usize) -> bool {
        let normalized = normalize_url(url);
        let key = normalized.as_str().to_string();
        if self.visited.contains(&key) {
            return false;
        }
        self.visited.insert(key);
        self.queue.push_back(FrontierEntry {
            url: normalized,
            depth,
        });
        true
    }

    pub fn pop(&mut self) -> Option<FrontierEntry> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    pub fn was_visited(&self, url: &Url) -> bool {
        self.visited.contains(normalize_url(url).as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn normalizes_fragment_and_trailing_slash() {
        let a = normalize_url(&url("https://Example.com/docs/#intro"));
        let b = normalize_url(&url("https://example.com/docs"));
        assert_eq!(a, b);
    }

    #[test]
    fn root_path_keeps_slash() {
        let root = normalize_url(&url("https://example.com/#top"));
        assert_eq!(root.as_str(), "https://example.com/");
    }

    #[test]
    fn rejects_duplicates() {
        let mut frontier = Frontier::new();
        assert!(frontier.push(&url("https://example.com/a/"), 0));
        assert!(!frontier.push(&url("https://example.com/a#x"), 1));
        assert_eq!(frontier.pending(), 1);
        assert_eq!(frontier.visited_count(), 1);
    }

    #[test]
    fn pops_in_fifo_order() {
        let mut frontier = Frontier::new();
        frontier.push(&url("https://example.com/1"), 0);
        frontier.push(&url("https://example.com/2"), 1);
        assert_eq!(frontier.pop().unwrap().url.path(), "/1");
        assert_eq!(frontier.pop().unwrap().depth, 1);
        assert!(frontier.is_empty());
    }
}
