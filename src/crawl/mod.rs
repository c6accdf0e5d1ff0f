//! Crawl job state: options, records, error taxonomy, and the URL frontier.

pub mod frontier;
pub mod job;

pub use frontier::{Frontier, normalize_url};
pub use job::{
    CancelToken, CrawlError, CrawlJob, CrawlResult, FailureKind, JobStatus, MirrorOptions,
    PageRecord,
};
