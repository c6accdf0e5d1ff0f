//! Bypass state machine.
//!
//! One entry point, [`BypassEngine::resolve_page`], takes a freshly navigated
//! page from Unknown through classification to Resolved or Failed. Attempts
//! are bounded and every one of them lands in the attempt trail that ends up
//! on the page record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::browser::{BrowserError, SessionHandle};
use crate::crawl::CancelToken;
use crate::external_deps::captcha::CaptchaProvider;
use crate::external_deps::interpreters::JavascriptInterpreter;

use super::captcha::{CaptchaGateError, CaptchaGateSolver};
use super::classifier::{self, ChallengeKind, PageSnapshot};
use super::script::{ScriptChallengeError, ScriptChallengeSolver};
use super::SolverConfig;

/// Errors that abort resolution instead of becoming a Failed outcome.
#[derive(Debug, Error)]
pub enum BypassError {
    #[error("job cancelled")]
    Cancelled,
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Result of one resolution attempt, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Resolved,
    Unresolved,
    Error,
}

/// One entry in a page's challenge trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeAttempt {
    pub page_url: String,
    pub kind: String,
    pub strategy: String,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Terminal state of one page's bypass.
#[derive(Debug)]
pub enum BypassResolution {
    Resolved {
        markup: String,
        resolved_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
}

/// Classification plus terminal state plus the full attempt trail.
#[derive(Debug)]
pub struct BypassOutcome {
    pub kind: ChallengeKind,
    pub resolution: BypassResolution,
    pub trail: Vec<ChallengeAttempt>,
}

impl BypassOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self.resolution, BypassResolution::Resolved { .. })
    }
}

/// Drives classified pages to resolution with bounded, backed-off attempts.
pub struct BypassEngine {
    script_solver: ScriptChallengeSolver,
    captcha_solver: CaptchaGateSolver,
    config: SolverConfig,
}

impl BypassEngine {
    pub fn new(
        interpreter: Arc<dyn JavascriptInterpreter>,
        captcha_providers: Vec<Arc<dyn CaptchaProvider>>,
        config: SolverConfig,
    ) -> Self {
        Self {
            script_solver: ScriptChallengeSolver::new(interpreter, config.clone()),
            captcha_solver: CaptchaGateSolver::new(captcha_providers, config.clone()),
            config,
        }
    }

    /// Classify the page currently loaded in `session` and drive it to a
    /// terminal state. The returned markup is the cleared page when resolved.
    pub async fn resolve_page(
        &self,
        session: &mut dyn SessionHandle,
        page_url: &Url,
        status: u16,
        cancel: &CancelToken,
    ) -> Result<BypassOutcome, BypassError> {
        let mut markup = session.serialize().await?;
        let mut classification = classifier::classify(&PageSnapshot {
            url: page_url,
            status,
            body: &markup,
        });

        match classification.kind {
            ChallengeKind::None => {
                return Ok(BypassOutcome {
                    kind: ChallengeKind::None,
                    resolution: BypassResolution::Resolved {
                        markup,
                        resolved_at: Utc::now(),
                    },
                    trail: Vec::new(),
                });
            }
            ChallengeKind::HardBlock => {
                log::warn!(
                    "hard block on {page_url} (markers: {:?})",
                    classification.matched_markers
                );
                return Ok(BypassOutcome {
                    kind: ChallengeKind::HardBlock,
                    resolution: BypassResolution::Failed {
                        reason: "access denied with no resolution path".into(),
                    },
                    trail: Vec::new(),
                });
            }
            ChallengeKind::ScriptChallenge | ChallengeKind::Captcha => {}
        }

        let kind = classification.kind;
        log::info!(
            "challenge on {page_url}: {} (markers: {:?})",
            kind.as_str(),
            classification.matched_markers
        );

        let mut trail = Vec::new();
        let mut last_reason = String::from("unresolved");
        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(BypassError::Cancelled);
            }

            let started = tokio::time::Instant::now();
            let (strategy, result) = match kind {
                ChallengeKind::ScriptChallenge => (
                    "script_eval",
                    self.script_solver
                        .resolve(session, page_url, &markup, cancel)
                        .await
                        .map_err(AttemptError::Script),
                ),
                ChallengeKind::Captcha => {
                    let Some(family) = classification.captcha_kind else {
                        return Ok(BypassOutcome {
                            kind,
                            resolution: BypassResolution::Failed {
                                reason: "unrecognized captcha family".into(),
                            },
                            trail,
                        });
                    };
                    (
                        "captcha_token",
                        self.captcha_solver
                            .resolve(session, page_url, &markup, family, cancel)
                            .await
                            .map_err(AttemptError::Captcha),
                    )
                }
                _ => unreachable!(),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(cleared) => {
                    trail.push(attempt_entry(
                        page_url,
                        kind,
                        strategy,
                        AttemptOutcome::Resolved,
                        duration_ms,
                    ));
                    return Ok(BypassOutcome {
                        kind,
                        resolution: BypassResolution::Resolved {
                            markup: cleared,
                            resolved_at: Utc::now(),
                        },
                        trail,
                    });
                }
                Err(err) if err.is_cancelled() => return Err(BypassError::Cancelled),
                Err(err) => {
                    log::debug!("attempt {attempt} on {page_url} failed: {err}");
                    last_reason = err.to_string();
                    trail.push(attempt_entry(
                        page_url,
                        kind,
                        strategy,
                        err.outcome(),
                        duration_ms,
                    ));
                }
            }

            if attempt < self.config.max_attempts {
                self.backoff(attempt, cancel).await?;
                // Fresh navigation before the next attempt; the gate may have
                // rotated its parameters or cleared on its own.
                let navigation = session
                    .navigate(page_url, self.config.navigation_timeout)
                    .await?;
                markup = session.serialize().await?;
                classification = classifier::classify(&PageSnapshot {
                    url: page_url,
                    status: navigation.status,
                    body: &markup,
                });
                if classification.kind == ChallengeKind::None {
                    return Ok(BypassOutcome {
                        kind,
                        resolution: BypassResolution::Resolved {
                            markup,
                            resolved_at: Utc::now(),
                        },
                        trail,
                    });
                }
            }
        }

        Ok(BypassOutcome {
            kind,
            resolution: BypassResolution::Failed { reason: last_reason },
            trail,
        })
    }

    /// Exponential backoff with jitter between attempts.
    async fn backoff(&self, attempt: usize, cancel: &CancelToken) -> Result<(), BypassError> {
        let base = self.config.backoff_base.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        let delay = Duration::from_millis(base.saturating_mul(1 << (attempt - 1)) + jitter);

        let slice = Duration::from_millis(50);
        let mut remaining = delay;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return Err(BypassError::Cancelled);
            }
            let step = remaining.min(slice);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        Ok(())
    }
}

fn attempt_entry(
    page_url: &Url,
    kind: ChallengeKind,
    strategy: &str,
    outcome: AttemptOutcome,
    duration_ms: u64,
) -> ChallengeAttempt {
    ChallengeAttempt {
        page_url: page_url.to_string(),
        kind: kind.as_str().to_string(),
        strategy: strategy.to_string(),
        outcome,
        duration_ms,
        timestamp: Utc::now(),
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Script(ScriptChallengeError),
    #[error(transparent)]
    Captcha(CaptchaGateError),
}

impl AttemptError {
    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            AttemptError::Script(ScriptChallengeError::Cancelled)
                | AttemptError::Captcha(CaptchaGateError::Cancelled)
        )
    }

    fn outcome(&self) -> AttemptOutcome {
        match self {
            AttemptError::Script(ScriptChallengeError::Unresolved)
            | AttemptError::Captcha(CaptchaGateError::Unresolved) => AttemptOutcome::Unresolved,
            _ => AttemptOutcome::Error,
        }
    }
}
