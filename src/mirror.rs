//! Top-level mirroring facade and crawl orchestrator.
//!
//! [`SiteMirror`] owns every component for one job: the session pool, the
//! bypass engine, the capture pipeline, the proxy pool, and the event
//! dispatcher. Page tasks run in a bounded `JoinSet` and hand their results
//! back over the set; the orchestrator is the only writer of job state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use url::{Origin, Url};

use crate::assets::{
    AssetConfig, AssetFailure, CaptureError, CapturePipeline, FetchedBody,
    HttpResourceFetcher, ResourceFetcher, extract_links, rewrite_page_links,
};
use crate::browser::{
    BrowserAutomation, BrowserError, HttpBrowser, SessionPool, SessionPoolConfig,
};
use crate::challenges::{BypassEngine, BypassError, BypassOutcome, BypassResolution, ChallengeKind, SolverConfig};
use crate::crawl::{
    CancelToken, CrawlError, CrawlJob, CrawlResult, FailureKind, Frontier, JobStatus,
    MirrorOptions, PageRecord, normalize_url,
};
use crate::external_deps::captcha::CaptchaProvider;
use crate::external_deps::interpreters::{BoaJavascriptInterpreter, JavascriptInterpreter};
use crate::modules::events::{
    ChallengeObservedEvent, EventDispatcher, EventHandler, JobFinishedEvent, LoggingHandler,
    MirrorEvent, MirrorPhase, PageCapturedEvent, PageFailedEvent, PageStartedEvent,
    ProgressChannelHandler, ProgressEvent,
};
use crate::modules::proxy::{ProxyConfig, ProxyManager, ProxySelection, RotationStrategy};
use crate::modules::store::JobStore;
use crate::verify::{Verifier, VerifyConfig};

/// Failures that prevent a job from starting or tearing down cleanly.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("invalid root url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("manifest serialization failed: {0}")]
    Manifest(#[from] serde_json::Error),
}

pub type MirrorResult<T> = Result<T, MirrorError>;

/// Full configuration for one mirroring job.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub options: MirrorOptions,
    pub solver: SolverConfig,
    pub assets: AssetConfig,
    pub verify: VerifyConfig,
    pub sessions: SessionPoolConfig,
    pub proxy: ProxyConfig,
    pub proxy_endpoints: Vec<String>,
    pub rotation_strategy: RotationStrategy,
    pub user_agent: String,
    /// Where to persist job snapshots; `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            options: MirrorOptions::default(),
            solver: SolverConfig::default(),
            assets: AssetConfig::default(),
            verify: VerifyConfig::default(),
            sessions: SessionPoolConfig::default(),
            proxy: ProxyConfig::default(),
            proxy_endpoints: Vec::new(),
            rotation_strategy: RotationStrategy::default(),
            user_agent: concat!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) ",
                "AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0 Safari/537.36"
            )
            .to_string(),
            snapshot_path: None,
        }
    }
}

/// Builder over [`MirrorConfig`] plus the pluggable collaborators.
pub struct SiteMirrorBuilder {
    config: MirrorConfig,
    automation: Option<Arc<dyn BrowserAutomation>>,
    fetcher: Option<Arc<dyn ResourceFetcher>>,
    interpreter: Option<Arc<dyn JavascriptInterpreter>>,
    captcha_providers: Vec<Arc<dyn CaptchaProvider>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl SiteMirrorBuilder {
    pub fn new() -> Self {
        Self {
            config: MirrorConfig::default(),
            automation: None,
            fetcher: None,
            interpreter: None,
            captcha_providers: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.config.options.max_pages = max_pages;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.config.options.max_depth = max_depth;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.options.concurrency = concurrency.max(1);
        self
    }

    pub fn timeout_per_page(mut self, timeout: Duration) -> Self {
        self.config.options.timeout_per_page = timeout;
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.options.job_timeout = timeout;
        self
    }

    pub fn with_proxies<I>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.config.proxy_endpoints = endpoints.into_iter().map(Into::into).collect();
        self.config.options.proxy_enabled = !self.config.proxy_endpoints.is_empty();
        self
    }

    pub fn rotation_strategy(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation_strategy = strategy;
        self
    }

    pub fn solver_config(mut self, solver: SolverConfig) -> Self {
        self.config.solver = solver;
        self
    }

    pub fn asset_config(mut self, assets: AssetConfig) -> Self {
        self.config.assets = assets;
        self
    }

    pub fn certified_threshold(mut self, threshold: f64) -> Self {
        self.config.verify.certified_threshold = threshold;
        self
    }

    pub fn session_pool_config(mut self, sessions: SessionPoolConfig) -> Self {
        self.config.sessions = sessions;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_path = Some(path.into());
        self
    }

    pub fn with_automation(mut self, automation: Arc<dyn BrowserAutomation>) -> Self {
        self.automation = Some(automation);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_interpreter(mut self, interpreter: Arc<dyn JavascriptInterpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.captcha_providers.push(provider);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self, output_root: impl Into<PathBuf>) -> SiteMirror {
        let config = self.config;
        let interpreter = self
            .interpreter
            .unwrap_or_else(|| Arc::new(BoaJavascriptInterpreter::new()));
        let automation = self.automation.unwrap_or_else(|| {
            Arc::new(HttpBrowser::new().with_user_agent(config.user_agent.clone()))
        });
        let fetcher = self.fetcher.unwrap_or_else(|| {
            Arc::new(HttpResourceFetcher::new(
                config.assets.clone(),
                config.user_agent.clone(),
            ))
        });

        let output_root = output_root.into();
        let proxies = Arc::new(ProxyManager::new(config.proxy.clone()));
        proxies.load(config.proxy_endpoints.clone());

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.register_handler(Arc::new(ProgressChannelHandler::new(progress_tx)));
        for handler in self.handlers {
            dispatcher.register_handler(handler);
        }

        SiteMirror {
            fetcher: fetcher.clone(),
            sessions: Arc::new(SessionPool::new(automation, config.sessions.clone())),
            engine: Arc::new(BypassEngine::new(
                interpreter.clone(),
                self.captcha_providers,
                config.solver.clone(),
            )),
            pipeline: Arc::new(CapturePipeline::new(
                output_root.clone(),
                config.assets.clone(),
                fetcher,
            )),
            verifier: Verifier::new(config.verify.clone()).with_interpreter(interpreter),
            proxies,
            dispatcher: Arc::new(dispatcher),
            cancel: CancelToken::new(),
            progress: std::sync::Mutex::new(Some(progress_rx)),
            output_root,
            config,
        }
    }
}

impl Default for SiteMirrorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One configured mirroring job. Construct with [`SiteMirrorBuilder`].
pub struct SiteMirror {
    config: MirrorConfig,
    output_root: PathBuf,
    sessions: Arc<SessionPool>,
    engine: Arc<BypassEngine>,
    pipeline: Arc<CapturePipeline>,
    fetcher: Arc<dyn ResourceFetcher>,
    verifier: Verifier,
    proxies: Arc<ProxyManager>,
    dispatcher: Arc<EventDispatcher>,
    cancel: CancelToken,
    progress: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ProgressEvent>>>,
}

enum PageOutcome {
    Captured {
        record: PageRecord,
        html: String,
        links: Vec<Url>,
        asset_failures: Vec<AssetFailure>,
        challenge: Option<(String, usize)>,
    },
    Failed {
        error: CrawlError,
        challenge: Option<(String, usize)>,
    },
    Fatal {
        error: CrawlError,
    },
    Cancelled,
}

struct PageTaskResult {
    url: Url,
    depth: usize,
    elapsed: Duration,
    outcome: PageOutcome,
}

impl SiteMirror {
    pub fn builder() -> SiteMirrorBuilder {
        SiteMirrorBuilder::new()
    }

    /// Token that cancels this job from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Take the progress stream. Yields one event per state transition; can
    /// be taken once.
    pub fn progress_stream(&self) -> Option<mpsc::UnboundedReceiver<ProgressEvent>> {
        self.progress.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Current proxy pool health.
    pub fn proxy_health(&self) -> crate::modules::proxy::ProxyHealthReport {
        self.proxies.health_report()
    }

    /// Mirror the site rooted at `root_url` into the output directory.
    ///
    /// Always returns a result for jobs that started: page failures
    /// accumulate in `errors` and the job only counts as failed when nothing
    /// was captured.
    pub async fn run(&self, root_url: &str) -> MirrorResult<CrawlResult> {
        let root = Url::parse(root_url)?;
        tokio::fs::create_dir_all(&self.output_root).await?;

        let snapshot_store = self.open_snapshot_store();
        let mut job = CrawlJob::new(root.as_str(), self.config.options.clone());
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());

        let mut frontier = Frontier::new();
        frontier.push(&root, 0);
        self.emit_progress(MirrorPhase::Crawling, Some(root.as_str()), 0, 1);

        let deadline = tokio::time::Instant::now() + self.config.options.job_timeout;
        let mut join_set: JoinSet<PageTaskResult> = JoinSet::new();
        let mut pages: Vec<PageRecord> = Vec::new();
        let mut captured: Vec<(Url, String)> = Vec::new();
        let mut timed_out = false;
        let mut invariant_violated = false;

        loop {
            // The page budget counts captures, not dequeues: a failed page
            // frees its slot so the crawl keeps filling up to max_pages.
            while !self.cancel.is_cancelled()
                && !invariant_violated
                && join_set.len() < self.config.options.concurrency
                && job.pages_captured + join_set.len() < self.config.options.max_pages
                && let Some(entry) = frontier.pop()
            {
                self.dispatcher
                    .dispatch(MirrorEvent::PageStarted(PageStartedEvent {
                        url: entry.url.clone(),
                        depth: entry.depth,
                        timestamp: Utc::now(),
                    }));
                self.emit_progress(
                    MirrorPhase::Crawling,
                    Some(entry.url.as_str()),
                    job.pages_captured,
                    frontier.visited_count().min(self.config.options.max_pages),
                );
                join_set.spawn(self.spawn_page_task(entry.url, entry.depth));
            }

            if join_set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    log::warn!("job deadline exceeded, cancelling remaining tasks");
                    timed_out = true;
                    self.cancel.cancel();
                    job.record_error(CrawlError::new(
                        None,
                        FailureKind::PageTimeout,
                        "job deadline exceeded",
                    ));
                    continue;
                }
            };

            let Some(joined) = joined else {
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(err) => {
                    log::warn!("page task aborted: {err}");
                    job.record_error(CrawlError::new(
                        None,
                        FailureKind::Network,
                        format!("page task aborted: {err}"),
                    ));
                    continue;
                }
            };

            match result.outcome {
                PageOutcome::Captured {
                    record,
                    html,
                    links,
                    asset_failures,
                    challenge,
                } => {
                    job.pages_captured += 1;
                    for failure in asset_failures {
                        let kind = if failure.too_large {
                            FailureKind::ResourceTooLarge
                        } else {
                            FailureKind::Network
                        };
                        job.record_error(CrawlError::new(
                            Some(failure.url),
                            kind,
                            failure.message,
                        ));
                    }
                    if let Some((kind, attempts)) = challenge {
                        self.emit_progress(
                            MirrorPhase::Resolving,
                            Some(result.url.as_str()),
                            job.pages_captured,
                            frontier.visited_count().min(self.config.options.max_pages),
                        );
                        self.emit_challenge(&result.url, kind, true, attempts);
                    }
                    self.dispatcher
                        .dispatch(MirrorEvent::PageCaptured(PageCapturedEvent {
                            url: result.url.clone(),
                            depth: result.depth,
                            assets: record.asset_refs.len(),
                            elapsed: result.elapsed,
                            timestamp: Utc::now(),
                        }));
                    self.emit_progress(
                        MirrorPhase::Capturing,
                        Some(result.url.as_str()),
                        job.pages_captured,
                        frontier.visited_count().min(self.config.options.max_pages),
                    );

                    if result.depth < self.config.options.max_depth {
                        for link in links {
                            if same_origin(&link, &root) {
                                frontier.push(&link, result.depth + 1);
                            }
                        }
                    }

                    captured.push((result.url, html));
                    pages.push(record);
                }
                PageOutcome::Failed { error, challenge } => {
                    if let Some((kind, attempts)) = challenge {
                        self.emit_challenge(&result.url, kind, false, attempts);
                    }
                    self.dispatcher
                        .dispatch(MirrorEvent::PageFailed(PageFailedEvent {
                            url: result.url.clone(),
                            reason: error.message.clone(),
                            timestamp: Utc::now(),
                        }));
                    job.record_error(error);
                }
                PageOutcome::Fatal { error } => {
                    log::error!("fatal: {}", error.message);
                    job.record_error(error);
                    invariant_violated = true;
                    self.cancel.cancel();
                }
                PageOutcome::Cancelled => {
                    // A task killed by the job deadline leaves its own trail.
                    if timed_out {
                        job.record_error(CrawlError::new(
                            Some(result.url.to_string()),
                            FailureKind::PageTimeout,
                            "cancelled by job deadline",
                        ));
                    }
                }
            }

            if let Some(store) = &snapshot_store
                && let Err(err) = store.save(&job)
            {
                log::warn!("snapshot save failed: {err}");
            }
        }

        let cancelled_by_caller =
            self.cancel.is_cancelled() && !timed_out && !invariant_violated;
        if cancelled_by_caller {
            job.record_error(CrawlError::new(
                None,
                FailureKind::JobCancelled,
                "job cancelled",
            ));
        }

        job.status = if invariant_violated {
            JobStatus::Failed
        } else if cancelled_by_caller {
            JobStatus::Cancelled
        } else if job.pages_captured == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        if job.status == JobStatus::Failed
            && let Some(headline) = job.first_error()
        {
            log::error!("job {} failed: {}", job.id, headline.message);
        }

        // Cross-page link pass: now that the captured set is final, anchors
        // between captured pages become relative local paths.
        let page_map: HashMap<String, String> = pages
            .iter()
            .map(|page| (page.url.clone(), page.local_path.clone()))
            .collect();
        for (url, html) in &captured {
            let local_path = page_local_path_of(&pages, url);
            let Some(local_path) = local_path else {
                continue;
            };
            let rewritten = rewrite_page_links(html, url, &page_map, &local_path);
            let target = self.output_root.join(&local_path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, rewritten).await?;
        }

        let verification = if job.status == JobStatus::Completed {
            self.emit_progress(
                MirrorPhase::Verifying,
                None,
                job.pages_captured,
                job.pages_captured,
            );
            let reference = self.fetch_reference(&root).await;
            Some(
                self.verifier
                    .verify(&self.output_root, &pages, reference.as_deref()),
            )
        } else {
            None
        };

        job.assets_captured = self.pipeline.distinct_files().await;
        job.finished_at = Some(Utc::now());
        self.write_manifest(&job, &pages, &verification).await?;
        self.sessions.shutdown().await;

        if let Some(store) = &snapshot_store
            && let Err(err) = store.save(&job)
        {
            log::warn!("final snapshot save failed: {err}");
        }

        self.dispatcher
            .dispatch(MirrorEvent::JobFinished(JobFinishedEvent {
                status: format!("{:?}", job.status),
                pages_captured: job.pages_captured,
                assets_captured: job.assets_captured,
                timestamp: Utc::now(),
            }));
        self.emit_progress(
            MirrorPhase::Done,
            None,
            job.pages_captured,
            job.pages_captured,
        );

        Ok(CrawlResult {
            success: job.status == JobStatus::Completed,
            status: job.status,
            pages_captured: job.pages_captured,
            assets_captured: job.assets_captured,
            errors: job.errors,
            pages,
            verification,
        })
    }

    /// Future executing one page end to end: lease, navigate, resolve,
    /// capture. Owns its session for the duration and returns it on exit.
    fn spawn_page_task(
        &self,
        url: Url,
        depth: usize,
    ) -> impl Future<Output = PageTaskResult> + Send + 'static {
        let sessions = self.sessions.clone();
        let engine = self.engine.clone();
        let pipeline = self.pipeline.clone();
        let proxies = self.proxies.clone();
        let cancel = self.cancel.clone();
        let options = self.config.options.clone();
        let strategy = self.config.rotation_strategy;

        async move {
            let started = tokio::time::Instant::now();
            let finish = |outcome| PageTaskResult {
                url: url.clone(),
                depth,
                elapsed: started.elapsed(),
                outcome,
            };

            if cancel.is_cancelled() {
                return finish(PageOutcome::Cancelled);
            }

            let selection = if options.proxy_enabled {
                proxies.next(strategy, url.host_str())
            } else {
                ProxySelection::Direct
            };

            let mut lease = match sessions.lease(selection.endpoint()).await {
                Ok(lease) => lease,
                Err(err) => {
                    return finish(PageOutcome::Failed {
                        error: CrawlError::new(
                            Some(url.to_string()),
                            FailureKind::Network,
                            format!("session lease failed: {err}"),
                        ),
                        challenge: None,
                    });
                }
            };

            let navigation = match lease.handle.navigate(&url, options.timeout_per_page).await
            {
                Ok(navigation) => navigation,
                Err(err) => {
                    proxies.report_outcome(&selection, false, started.elapsed());
                    sessions.release(lease, false).await;
                    let kind = match err {
                        BrowserError::Timeout(_) => FailureKind::PageTimeout,
                        _ => FailureKind::Network,
                    };
                    return finish(PageOutcome::Failed {
                        error: CrawlError::new(Some(url.to_string()), kind, err.to_string()),
                        challenge: None,
                    });
                }
            };

            if cancel.is_cancelled() {
                sessions.release(lease, true).await;
                return finish(PageOutcome::Cancelled);
            }

            let outcome = engine
                .resolve_page(lease.handle.as_mut(), &url, navigation.status, &cancel)
                .await;
            let bypass = match outcome {
                Ok(bypass) => bypass,
                Err(BypassError::Cancelled) => {
                    sessions.release(lease, true).await;
                    return finish(PageOutcome::Cancelled);
                }
                Err(BypassError::Browser(err)) => {
                    proxies.report_outcome(&selection, false, started.elapsed());
                    sessions.release(lease, false).await;
                    return finish(PageOutcome::Failed {
                        error: CrawlError::new(
                            Some(url.to_string()),
                            FailureKind::Network,
                            err.to_string(),
                        ),
                        challenge: None,
                    });
                }
            };

            let challenge = (bypass.kind != ChallengeKind::None)
                .then(|| (bypass.kind.as_str().to_string(), bypass.trail.len()));
            let BypassOutcome { kind, resolution, trail } = bypass;
            let (markup, resolved_at) = match resolution {
                BypassResolution::Resolved { markup, resolved_at } => (markup, resolved_at),
                BypassResolution::Failed { reason } => {
                    // Unsolved challenges count against the endpoint's health.
                    proxies.penalize(&selection);
                    sessions.release(lease, true).await;
                    return finish(PageOutcome::Failed {
                        error: CrawlError::new(
                            Some(url.to_string()),
                            FailureKind::ChallengeUnsolved,
                            reason,
                        ),
                        challenge,
                    });
                }
            };
            proxies.report_outcome(&selection, true, started.elapsed());

            let intercepted = lease.handle.drain_intercepted();
            let page = match pipeline
                .capture(&url, &markup, intercepted, selection.endpoint(), &cancel)
                .await
            {
                Ok(page) => page,
                Err(CaptureError::Cancelled) => {
                    sessions.release(lease, true).await;
                    return finish(PageOutcome::Cancelled);
                }
                Err(CaptureError::Collision(err)) => {
                    sessions.release(lease, true).await;
                    return finish(PageOutcome::Fatal {
                        error: CrawlError::new(
                            Some(url.to_string()),
                            FailureKind::InvariantViolation,
                            err.to_string(),
                        ),
                    });
                }
                Err(CaptureError::Io(err)) => {
                    sessions.release(lease, true).await;
                    return finish(PageOutcome::Failed {
                        error: CrawlError::new(
                            Some(url.to_string()),
                            FailureKind::Unsupported,
                            format!("capture write failed: {err}"),
                        ),
                        challenge,
                    });
                }
            };
            sessions.release(lease, true).await;

            let links = extract_links(&markup, &url);
            let record = PageRecord {
                url: normalize_url(&url).to_string(),
                depth,
                http_status: navigation.status,
                challenge_kind: kind.as_str().to_string(),
                resolved_at: Some(resolved_at),
                local_path: page.local_path,
                extracted_links: links.iter().map(|l| l.to_string()).collect(),
                asset_refs: page.asset_urls,
                challenge_trail: trail,
            };

            finish(PageOutcome::Captured {
                record,
                html: page.html,
                links,
                asset_failures: page.failures,
                challenge,
            })
        }
    }

    /// Fresh copy of the root page for the structural comparison. The check
    /// is skipped when the origin cannot be re-fetched.
    async fn fetch_reference(&self, root: &Url) -> Option<String> {
        match self.fetcher.fetch(root, None, &self.output_root).await {
            Ok(asset) => match asset.body {
                FetchedBody::Buffered(bytes) => {
                    Some(String::from_utf8_lossy(&bytes).into_owned())
                }
                FetchedBody::Spooled(path) => {
                    let _ = tokio::fs::remove_file(&path).await;
                    None
                }
            },
            Err(err) => {
                log::debug!("reference fetch failed, skipping structural check: {err}");
                None
            }
        }
    }

    fn open_snapshot_store(&self) -> Option<JobStore> {
        let path = self.config.snapshot_path.as_ref()?;
        match JobStore::open(path) {
            Ok(store) => Some(store),
            Err(err) => {
                log::warn!("snapshot store unavailable: {err}");
                None
            }
        }
    }

    async fn write_manifest(
        &self,
        job: &CrawlJob,
        pages: &[PageRecord],
        verification: &Option<crate::verify::VerificationReport>,
    ) -> MirrorResult<()> {
        let manifest = serde_json::json!({
            "job": job,
            "pages": pages,
            "assets": self.pipeline.records().await,
            "verification": verification,
        });
        let payload = serde_json::to_string_pretty(&manifest)?;
        tokio::fs::write(self.output_root.join("manifest.json"), payload).await?;
        Ok(())
    }

    fn emit_progress(
        &self,
        phase: MirrorPhase,
        current_url: Option<&str>,
        page_index: usize,
        total_estimate: usize,
    ) {
        self.dispatcher
            .dispatch(MirrorEvent::Progress(ProgressEvent {
                phase,
                current_url: current_url.map(str::to_string),
                page_index,
                total_estimate,
            }));
    }

    fn emit_challenge(&self, url: &Url, kind: String, resolved: bool, attempts: usize) {
        self.dispatcher
            .dispatch(MirrorEvent::Challenge(ChallengeObservedEvent {
                url: url.clone(),
                kind,
                resolved,
                attempts,
                timestamp: Utc::now(),
            }));
    }
}

fn page_local_path_of(pages: &[PageRecord], url: &Url) -> Option<String> {
    let key = normalize_url(url).to_string();
    pages
        .iter()
        .find(|page| page.url == key)
        .map(|page| page.local_path.clone())
}

/// Same-origin test used by the frontier guard; subdomains are distinct.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    matches!((a.origin(), b.origin()), (Origin::Tuple(..), Origin::Tuple(..)) if a.origin() == b.origin())
}
