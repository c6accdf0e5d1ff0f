//! Script challenge resolution.
//!
//! A script challenge embeds a computation in the gate page; the page's own
//! script assigns the result to a hidden form field and submits the form after
//! a settle delay. We extract that computation, evaluate it in the sandboxed
//! interpreter, and post the answer back ourselves. When extraction fails the
//! solver falls back to a passive wait and re-navigation, which clears gates
//! that only check cookies and timing.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use url::Url;

use crate::browser::{BrowserError, SessionHandle};
use crate::crawl::CancelToken;
use crate::external_deps::interpreters::{InterpreterError, JavascriptInterpreter};

use super::classifier::{self, ChallengeKind, PageSnapshot};
use super::SolverConfig;

#[derive(Debug, Error)]
pub enum ScriptChallengeError {
    #[error("challenge parameters not extractable: {0}")]
    Parameters(String),
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("challenge form action is not a valid url: {0}")]
    InvalidAction(#[from] url::ParseError),
    #[error("challenge did not clear within the poll window")]
    Unresolved,
    #[error("job cancelled")]
    Cancelled,
}

/// Everything needed to answer one script challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptChallengeParams {
    pub form_action: String,
    pub answer_field: String,
    pub hidden_fields: Vec<(String, String)>,
    pub expression: String,
    pub settle_delay: Duration,
}

static FORM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"<form[^>]+id\s*=\s*["']challenge-form["'][^>]*action\s*=\s*["'](?P<action>[^"']*)["'][^>]*>(?P<inner>.*?)</form>"#,
    )
    .case_insensitive(true)
    .dot_matches_new_line(true)
    .build()
    .unwrap()
});

static INPUT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"<input[^>]*>")
        .case_insensitive(true)
        .build()
        .unwrap()
});

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"name\s*=\s*["']([^"']+)["']"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static VALUE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"value\s*=\s*["']([^"']*)["']"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"<script[^>]*>(?P<body>.*?)</script>")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

static ANSWER_ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"document\.getElementById\(\s*["'](?P<field>[^"']+)["']\s*\)\.value\s*="#,
    )
    .dot_matches_new_line(true)
    .build()
    .unwrap()
});

static SETTLE_DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"setTimeout\s*\(.*?,\s*(?P<ms>\d+)\s*\)")
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

const MAX_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Extract challenge parameters from gate markup.
pub fn parse_script_challenge(body: &str) -> Result<ScriptChallengeParams, ScriptChallengeError> {
    let form = FORM_RE
        .captures(body)
        .ok_or_else(|| ScriptChallengeError::Parameters("challenge form not found".into()))?;
    let form_action = form["action"].to_string();
    let inner = &form["inner"];

    let mut answer_field = None;
    let mut hidden_fields = Vec::new();
    for input in INPUT_RE.find_iter(inner) {
        let tag = input.as_str();
        let Some(name) = NAME_RE.captures(tag).map(|c| c[1].to_string()) else {
            continue;
        };
        if name.to_ascii_lowercase().contains("answer") {
            answer_field = Some(name);
        } else {
            let value = VALUE_RE
                .captures(tag)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            hidden_fields.push((name, value));
        }
    }
    let answer_field = answer_field
        .ok_or_else(|| ScriptChallengeError::Parameters("answer field not found".into()))?;

    let script = SCRIPT_RE
        .captures_iter(body)
        .map(|caps| caps["body"].to_string())
        .find(|script| script.contains(&answer_field))
        .ok_or_else(|| {
            ScriptChallengeError::Parameters("challenge script not found".into())
        })?;

    let assigns_answer = ANSWER_ASSIGN_RE
        .captures(&script)
        .is_some_and(|caps| caps["field"] == *answer_field);
    if !assigns_answer {
        return Err(ScriptChallengeError::Parameters(
            "challenge script does not assign the answer field".into(),
        ));
    }

    // Rewrite the DOM assignment into a plain variable so the expression can
    // run headless and yield the answer as its final value.
    let rewritten = ANSWER_ASSIGN_RE.replace(&script, "var __challenge_answer =");
    let expression = format!("{rewritten}\n__challenge_answer;");

    let settle_delay = SETTLE_DELAY_RE
        .captures(&script)
        .and_then(|caps| caps["ms"].parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
        .min(MAX_SETTLE_DELAY);

    Ok(ScriptChallengeParams {
        form_action,
        answer_field,
        hidden_fields,
        expression,
        settle_delay,
    })
}

/// Drives one script challenge to resolution against a leased session.
pub struct ScriptChallengeSolver {
    interpreter: Arc<dyn JavascriptInterpreter>,
    config: SolverConfig,
}

impl ScriptChallengeSolver {
    pub fn new(interpreter: Arc<dyn JavascriptInterpreter>, config: SolverConfig) -> Self {
        Self {
            interpreter,
            config,
        }
    }

    /// Resolve a classified script challenge. Returns the cleared page markup.
    pub async fn resolve(
        &self,
        session: &mut dyn SessionHandle,
        page_url: &Url,
        body: &str,
        cancel: &CancelToken,
    ) -> Result<String, ScriptChallengeError> {
        match parse_script_challenge(body) {
            Ok(params) => self.resolve_active(session, page_url, params, cancel).await,
            Err(err) => {
                log::debug!("script challenge on {page_url}: {err}; falling back to passive wait");
                self.resolve_passive(session, page_url, cancel).await
            }
        }
    }

    async fn resolve_active(
        &self,
        session: &mut dyn SessionHandle,
        page_url: &Url,
        params: ScriptChallengeParams,
        cancel: &CancelToken,
    ) -> Result<String, ScriptChallengeError> {
        let host = page_url.host_str().unwrap_or("localhost");
        let answer = self
            .interpreter
            .solve_expression(&params.expression, host)?;
        log::debug!(
            "script challenge on {page_url}: answer computed for field {}",
            params.answer_field
        );

        // Gate backends reject answers posted before the page's own timer
        // would have fired.
        self.wait(params.settle_delay, cancel).await?;

        let action = page_url.join(&params.form_action)?;
        let mut fields = params.hidden_fields;
        fields.push((params.answer_field, answer));
        session.submit_form(&action, &fields).await?;

        self.poll_until_clear(session, page_url, cancel).await
    }

    async fn resolve_passive(
        &self,
        session: &mut dyn SessionHandle,
        page_url: &Url,
        cancel: &CancelToken,
    ) -> Result<String, ScriptChallengeError> {
        self.wait(self.config.passive_wait, cancel).await?;
        let navigation = session
            .navigate(page_url, self.config.navigation_timeout)
            .await?;
        let markup = session.serialize().await?;
        let snapshot = PageSnapshot {
            url: page_url,
            status: navigation.status,
            body: &markup,
        };
        if classifier::classify(&snapshot).kind == ChallengeKind::None {
            Ok(markup)
        } else {
            Err(ScriptChallengeError::Unresolved)
        }
    }

    /// Re-serialize and classify until the gate clears or the window closes.
    async fn poll_until_clear(
        &self,
        session: &mut dyn SessionHandle,
        page_url: &Url,
        cancel: &CancelToken,
    ) -> Result<String, ScriptChallengeError> {
        let deadline = tokio::time::Instant::now() + self.config.poll_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(ScriptChallengeError::Cancelled);
            }
            let markup = session.serialize().await?;
            // The submission already happened; only markers can tell whether
            // the gate cleared.
            if !classifier::looks_like_gate(&markup) {
                return Ok(markup);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScriptChallengeError::Unresolved);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Sleep in short slices so cancellation interrupts long waits.
    async fn wait(&self, total: Duration, cancel: &CancelToken) -> Result<(), ScriptChallengeError> {
        let slice = Duration::from_millis(100);
        let mut remaining = total;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return Err(ScriptChallengeError::Cancelled);
            }
            let step = remaining.min(slice);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        Ok(())
    }
}
