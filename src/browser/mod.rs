//! Browser automation seam and session pooling.
//!
//! The crawl never talks to a browser directly: it leases a session from the
//! [`SessionPool`], drives it through the [`SessionHandle`] trait, and hands
//! it back. Any automation backend (CDP driver, plain HTTP client) plugs in
//! behind [`BrowserAutomation`].

mod http;
mod pool;

pub use http::HttpBrowser;
pub use pool::{SessionLease, SessionPool, SessionPoolConfig};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// Failures surfaced by automation backends.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("session is closed")]
    SessionClosed,
    #[error("script evaluation failed: {0}")]
    Evaluation(String),
    #[error("session pool shut down")]
    PoolClosed,
}

/// Result of a navigation: final status and URL after redirects.
#[derive(Debug, Clone)]
pub struct Navigation {
    pub status: u16,
    pub final_url: Url,
}

/// A live page session. Leased to exactly one task at a time; the pool is the
/// only owner between leases.
#[async_trait]
pub trait SessionHandle: Send {
    async fn navigate(&mut self, url: &Url, timeout: Duration) -> Result<Navigation, BrowserError>;

    /// Serialize the current page to markup.
    async fn serialize(&mut self) -> Result<String, BrowserError>;

    /// Evaluate a script in the page and return its value.
    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value, BrowserError>;

    /// Submit a form to `action` with the given fields (used to post challenge
    /// answers and captcha tokens back to the origin).
    async fn submit_form(
        &mut self,
        action: &Url,
        fields: &[(String, String)],
    ) -> Result<Navigation, BrowserError>;

    /// Drain resource URLs the page requested at runtime since the last call.
    /// Backends without request interception return an empty list.
    fn drain_intercepted(&mut self) -> Vec<Url>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Factory for page sessions, optionally bound to a proxy endpoint.
#[async_trait]
pub trait BrowserAutomation: Send + Sync {
    async fn open_session(
        &self,
        proxy: Option<&str>,
    ) -> Result<Box<dyn SessionHandle>, BrowserError>;
}
