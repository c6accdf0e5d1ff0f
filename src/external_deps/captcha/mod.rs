//! Captcha provider integrations.
//!
//! These adapters provide a unified interface for third-party captcha solvers
//! such as CapSolver, TwoCaptcha, and AntiCaptcha. The bypass engine iterates
//! providers in priority order; any single provider failure is non-fatal.

mod anticaptcha;
mod capsolver;
mod twocaptcha;

pub use anticaptcha::AntiCaptchaProvider;
pub use capsolver::CapSolverProvider;
pub use twocaptcha::TwoCaptchaProvider;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// Interactive captcha families the classifier can recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptchaKind {
    RecaptchaV2,
    Hcaptcha,
    Turnstile,
}

impl CaptchaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaKind::RecaptchaV2 => "recaptcha_v2",
            CaptchaKind::Hcaptcha => "hcaptcha",
            CaptchaKind::Turnstile => "turnstile",
        }
    }
}

/// High-level configuration that controls captcha solving behaviour.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Details describing the captcha the target site presented.
#[derive(Debug, Clone)]
pub struct CaptchaTask {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: Url,
}

impl CaptchaTask {
    pub fn new(kind: CaptchaKind, site_key: impl Into<String>, page_url: Url) -> Self {
        Self {
            kind,
            site_key: site_key.into(),
            page_url,
        }
    }
}

/// Resolved captcha token.
#[derive(Debug, Clone)]
pub struct CaptchaSolution {
    pub token: String,
}

impl CaptchaSolution {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Common result type returned by captcha providers. `Ok(None)` means the
/// provider declined the task (the caller moves on to the next provider).
pub type CaptchaResult = Result<Option<CaptchaSolution>, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult;
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha provider {0} not implemented")]
    NotImplemented(&'static str),
}
