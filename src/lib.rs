//! # sitemirror-rs
//!
//! An offline website mirroring engine: crawls a site, works through
//! anti-bot gates along the way, captures every referenced asset, rewrites
//! references for local use, and scores the result.
//!
//! ## Features
//!
//! - Concurrent breadth-first crawl with per-page and per-job deadlines
//! - Script-challenge and captcha gate resolution with bounded retries
//! - Asset capture with content-hash deduplication and stylesheet recursion
//! - Proxy pool with health windows, cooldowns, and rotation strategies
//! - Pooled browser sessions behind a pluggable automation trait
//! - Weighted post-capture verification with a certification threshold
//!
//! ## Example
//!
//! ```no_run
//! use sitemirror_rs::SiteMirror;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mirror = SiteMirror::builder()
//!         .max_pages(50)
//!         .concurrency(4)
//!         .build("./mirror-out");
//!     let result = mirror.run("https://example.com").await?;
//!     println!("captured {} pages", result.pages_captured);
//!     Ok(())
//! }
//! ```

mod mirror;

pub mod assets;
pub mod browser;
pub mod challenges;
pub mod crawl;
pub mod external_deps;
pub mod modules;
pub mod verify;

pub use crate::mirror::{
    MirrorConfig,
    MirrorError,
    MirrorResult,
    SiteMirror,
    SiteMirrorBuilder,
    same_origin,
};

pub use crate::crawl::{
    CancelToken,
    CrawlError,
    CrawlJob,
    CrawlResult,
    FailureKind,
    Frontier,
    JobStatus,
    MirrorOptions,
    PageRecord,
    normalize_url,
};

pub use crate::challenges::{
    AttemptOutcome,
    BypassEngine,
    BypassOutcome,
    BypassResolution,
    ChallengeAttempt,
    ChallengeKind,
    SolverConfig,
};

pub use crate::assets::{
    AssetConfig,
    AssetRecord,
    CapturePipeline,
    DownloadError,
    HttpResourceFetcher,
    ResourceFetcher,
};

pub use crate::browser::{
    BrowserAutomation,
    BrowserError,
    HttpBrowser,
    Navigation,
    SessionHandle,
    SessionLease,
    SessionPool,
    SessionPoolConfig,
};

pub use crate::verify::{
    VerificationCheck,
    VerificationReport,
    Verifier,
    VerifyConfig,
};

pub use crate::external_deps::captcha::{
    AntiCaptchaProvider,
    CapSolverProvider,
    CaptchaConfig,
    CaptchaError,
    CaptchaKind,
    CaptchaProvider,
    CaptchaResult,
    CaptchaSolution,
    CaptchaTask,
    TwoCaptchaProvider,
};

pub use crate::external_deps::interpreters::{
    BoaJavascriptInterpreter,
    InterpreterError,
    InterpreterResult,
    JavascriptInterpreter,
};

pub use crate::modules::{
    EndpointStats,
    EventDispatcher,
    EventHandler,
    JobStore,
    LoggingHandler,
    MirrorEvent,
    MirrorPhase,
    ProgressEvent,
    ProxyConfig,
    ProxyHealthReport,
    ProxyManager,
    ProxySelection,
    RotationStrategy,
    StoreError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
