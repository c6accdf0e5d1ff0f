//! Crawl lifecycle event system.
//!
//! Provides hooks for logging, progress streaming, and custom reactions around
//! orchestrator activity. One event is emitted per page/job state transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Coarse phase reported on the progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorPhase {
    Crawling,
    Resolving,
    Capturing,
    Verifying,
    Done,
}

/// Consumer-facing progress snapshot, one per state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: MirrorPhase,
    pub current_url: Option<String>,
    pub page_index: usize,
    pub total_estimate: usize,
}

#[derive(Debug, Clone)]
pub struct PageStartedEvent {
    pub url: Url,
    pub depth: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PageCapturedEvent {
    pub url: Url,
    pub depth: usize,
    pub assets: usize,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PageFailedEvent {
    pub url: Url,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeObservedEvent {
    pub url: Url,
    pub kind: String,
    pub resolved: bool,
    pub attempts: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobFinishedEvent {
    pub status: String,
    pub pages_captured: usize,
    pub assets_captured: usize,
    pub timestamp: DateTime<Utc>,
}

/// All events emitted by the orchestrator and its workers.
#[derive(Debug, Clone)]
pub enum MirrorEvent {
    PageStarted(PageStartedEvent),
    PageCaptured(PageCapturedEvent),
    PageFailed(PageFailedEvent),
    Challenge(ChallengeObservedEvent),
    Progress(ProgressEvent),
    JobFinished(JobFinishedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &MirrorEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: MirrorEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &MirrorEvent) {
        match event {
            MirrorEvent::PageStarted(e) => {
                log::debug!("-> page {} (depth {})", e.url, e.depth);
            }
            MirrorEvent::PageCaptured(e) => {
                log::info!(
                    "captured {} ({} assets, {:.2}s)",
                    e.url,
                    e.assets,
                    e.elapsed.as_secs_f64()
                );
            }
            MirrorEvent::PageFailed(e) => {
                log::warn!("page failed {} -> {}", e.url, e.reason);
            }
            MirrorEvent::Challenge(e) => {
                log::info!(
                    "challenge {} kind={} resolved={} attempts={}",
                    e.url,
                    e.kind,
                    e.resolved,
                    e.attempts
                );
            }
            MirrorEvent::Progress(e) => {
                log::debug!(
                    "progress {:?} {}/{}",
                    e.phase,
                    e.page_index,
                    e.total_estimate
                );
            }
            MirrorEvent::JobFinished(e) => {
                log::info!(
                    "job finished status={} pages={} assets={}",
                    e.status,
                    e.pages_captured,
                    e.assets_captured
                );
            }
        }
    }
}

/// Forwards [`ProgressEvent`]s to an mpsc channel consumed by the caller.
pub struct ProgressChannelHandler {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressChannelHandler {
    pub fn new(sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl EventHandler for ProgressChannelHandler {
    fn handle(&self, event: &MirrorEvent) {
        if let MirrorEvent::Progress(progress) = event {
            // A dropped receiver just means nobody is watching anymore.
            let _ = self.sender.send(progress.clone());
        }
    }
}
