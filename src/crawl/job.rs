//! Job-level data structures shared across the orchestrator and its workers.
//!
//! A [`CrawlJob`] is mutated only by the orchestrator; worker tasks hand their
//! results back over a completion channel and never touch shared collections
//! directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::challenges::engine::ChallengeAttempt;
use crate::verify::VerificationReport;

/// Classification of a recorded failure. Drives retry policy and reporting;
/// only `InvariantViolation` and `JobCancelled` ever abort work beyond the
/// failing page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Network,
    ChallengeUnsolved,
    ResourceTooLarge,
    Unsupported,
    PageTimeout,
    JobCancelled,
    InvariantViolation,
}

impl FailureKind {
    /// Failures that may be retried within the same task.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Network | FailureKind::ChallengeUnsolved)
    }

    /// Failures that terminate the whole job rather than a single page.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            FailureKind::JobCancelled | FailureKind::InvariantViolation
        )
    }
}

/// A single failure accumulated on the job or one of its pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlError {
    pub url: Option<String>,
    pub kind: FailureKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CrawlError {
    pub fn new(url: Option<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            url,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// User-facing crawl parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorOptions {
    pub max_pages: usize,
    pub max_depth: usize,
    pub concurrency: usize,
    pub timeout_per_page: Duration,
    /// Hard wall-clock limit for the whole job.
    pub job_timeout: Duration,
    pub proxy_enabled: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_depth: 3,
            concurrency: 4,
            timeout_per_page: Duration::from_secs(30),
            job_timeout: Duration::from_secs(600),
            proxy_enabled: false,
        }
    }
}

/// Lifecycle of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Immutable capture record for one visited URL. Created once per page;
/// verification may annotate it afterwards but capture data never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub depth: usize,
    pub http_status: u16,
    pub challenge_kind: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub local_path: String,
    pub extracted_links: Vec<String>,
    pub asset_refs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub challenge_trail: Vec<ChallengeAttempt>,
}

/// Aggregate job state. Owned and mutated exclusively by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    pub root_url: String,
    pub options: MirrorOptions,
    pub status: JobStatus,
    pub pages_captured: usize,
    pub assets_captured: usize,
    pub errors: Vec<CrawlError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CrawlJob {
    pub fn new(root_url: impl Into<String>, options: MirrorOptions) -> Self {
        let now = Utc::now();
        Self {
            id: format!("job-{}", now.timestamp_millis()),
            root_url: root_url.into(),
            options,
            status: JobStatus::Pending,
            pages_captured: 0,
            assets_captured: 0,
            errors: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn record_error(&mut self, error: CrawlError) {
        self.errors.push(error);
    }

    /// Failure headline for a job that captured nothing: the first fatal
    /// error, or the first error of any kind when none was fatal.
    pub fn first_error(&self) -> Option<&CrawlError> {
        self.errors
            .iter()
            .find(|error| error.kind.is_fatal())
            .or_else(|| self.errors.first())
    }
}

/// Final outcome returned by [`crate::SiteMirror::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub success: bool,
    pub status: JobStatus,
    pub pages_captured: usize,
    pub assets_captured: usize,
    pub errors: Vec<CrawlError>,
    pub pages: Vec<PageRecord>,
    pub verification: Option<VerificationReport>,
}

/// Job-level cancellation flag shared between the orchestrator and its tasks.
///
/// Checked between frontier dequeues and inside per-page/per-asset loops. A
/// cancelled job keeps its partial output on disk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
