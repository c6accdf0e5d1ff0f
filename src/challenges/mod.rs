//! Protection-bypass engine.
//!
//! Classifies what a navigated page actually returned (real content, a script
//! challenge, an interactive captcha, or a hard block) and drives it to
//! resolution with bounded retries.

pub mod captcha;
pub mod classifier;
pub mod engine;
pub mod script;

pub use captcha::{CaptchaGateError, CaptchaGateSolver};
pub use classifier::{ChallengeKind, Classification, PageSnapshot, classify};
pub use engine::{
    AttemptOutcome, BypassEngine, BypassError, BypassOutcome, BypassResolution, ChallengeAttempt,
};
pub use script::{ScriptChallengeError, ScriptChallengeParams, ScriptChallengeSolver};

use std::time::Duration;

/// Timing policy for challenge resolution. All constants are configuration,
/// not hard-coded behaviour.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Interval between polls while waiting for a submitted answer to clear.
    pub poll_interval: Duration,
    /// Upper bound on one active poll loop.
    pub poll_timeout: Duration,
    /// Longer passive wait used when parameter extraction fails.
    pub passive_wait: Duration,
    /// Base backoff between resolution attempts; doubles per attempt.
    pub backoff_base: Duration,
    /// Maximum resolution attempts per classification.
    pub max_attempts: usize,
    /// Deadline for the re-navigation performed by the passive strategy.
    pub navigation_timeout: Duration,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(750),
            poll_timeout: Duration::from_secs(15),
            passive_wait: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            max_attempts: 3,
            navigation_timeout: Duration::from_secs(30),
        }
    }
}
