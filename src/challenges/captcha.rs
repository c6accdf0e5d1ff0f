//! Interactive captcha resolution.
//!
//! Extracts the site key from the gate page, asks the configured providers
//! for a token in priority order, and posts the token back through the page's
//! challenge form. Any single provider failing or declining is non-fatal; the
//! gate only counts as unresolved once every provider has been tried.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::browser::{BrowserError, SessionHandle};
use crate::crawl::CancelToken;
use crate::external_deps::captcha::{CaptchaKind, CaptchaProvider, CaptchaTask};

use super::classifier;
use super::script::{self, ScriptChallengeError};
use super::SolverConfig;

#[derive(Debug, Error)]
pub enum CaptchaGateError {
    #[error("captcha site key not found in page markup")]
    SiteKeyMissing,
    #[error("no captcha provider configured")]
    NoProviders,
    #[error("all captcha providers failed or declined")]
    ProvidersExhausted,
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("challenge form action is not a valid url: {0}")]
    InvalidAction(#[from] url::ParseError),
    #[error("captcha token did not clear the gate")]
    Unresolved,
    #[error("job cancelled")]
    Cancelled,
}

fn response_field(kind: CaptchaKind) -> &'static str {
    match kind {
        CaptchaKind::RecaptchaV2 => "g-recaptcha-response",
        CaptchaKind::Hcaptcha => "h-captcha-response",
        CaptchaKind::Turnstile => "cf-turnstile-response",
    }
}

/// Drives one interactive captcha gate to resolution.
pub struct CaptchaGateSolver {
    providers: Vec<Arc<dyn CaptchaProvider>>,
    config: SolverConfig,
}

impl CaptchaGateSolver {
    pub fn new(providers: Vec<Arc<dyn CaptchaProvider>>, config: SolverConfig) -> Self {
        Self { providers, config }
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Resolve a classified captcha gate. Returns the cleared page markup.
    pub async fn resolve(
        &self,
        session: &mut dyn SessionHandle,
        page_url: &Url,
        body: &str,
        kind: CaptchaKind,
        cancel: &CancelToken,
    ) -> Result<String, CaptchaGateError> {
        if self.providers.is_empty() {
            return Err(CaptchaGateError::NoProviders);
        }
        let site_key =
            classifier::extract_site_key(body).ok_or(CaptchaGateError::SiteKeyMissing)?;
        let task = CaptchaTask::new(kind, site_key, page_url.clone());

        let token = self.solve_with_providers(&task, cancel).await?;

        // Reuse the challenge form when the gate carries one; otherwise the
        // token goes back to the page itself.
        let mut fields = Vec::new();
        let action = match script::parse_script_challenge(body) {
            Ok(params) => {
                fields = params.hidden_fields;
                page_url.join(&params.form_action)?
            }
            Err(_) => page_url.clone(),
        };
        fields.push((response_field(kind).to_string(), token));
        session.submit_form(&action, &fields).await?;

        self.poll_until_clear(session, page_url, cancel).await
    }

    async fn solve_with_providers(
        &self,
        task: &CaptchaTask,
        cancel: &CancelToken,
    ) -> Result<String, CaptchaGateError> {
        for provider in &self.providers {
            if cancel.is_cancelled() {
                return Err(CaptchaGateError::Cancelled);
            }
            match provider.solve(task).await {
                Ok(Some(solution)) => {
                    log::info!(
                        "captcha on {} solved by provider {}",
                        task.page_url,
                        provider.name()
                    );
                    return Ok(solution.token);
                }
                Ok(None) => {
                    log::debug!("captcha provider {} declined the task", provider.name());
                }
                Err(err) => {
                    log::warn!("captcha provider {} failed: {err}", provider.name());
                }
            }
        }
        Err(CaptchaGateError::ProvidersExhausted)
    }

    async fn poll_until_clear(
        &self,
        session: &mut dyn SessionHandle,
        page_url: &Url,
        cancel: &CancelToken,
    ) -> Result<String, CaptchaGateError> {
        let deadline = tokio::time::Instant::now() + self.config.poll_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(CaptchaGateError::Cancelled);
            }
            let markup = session.serialize().await?;
            if !classifier::looks_like_gate(&markup) {
                return Ok(markup);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CaptchaGateError::Unresolved);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

impl From<ScriptChallengeError> for CaptchaGateError {
    fn from(err: ScriptChallengeError) -> Self {
        match err {
            ScriptChallengeError::Browser(inner) => CaptchaGateError::Browser(inner),
            ScriptChallengeError::InvalidAction(inner) => CaptchaGateError::InvalidAction(inner),
            ScriptChallengeError::Cancelled => CaptchaGateError::Cancelled,
            _ => CaptchaGateError::Unresolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Navigation;
    use crate::external_deps::captcha::{
        CaptchaError, CaptchaResult, CaptchaSolution,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CAPTCHA_PAGE: &str = r#"
        <html><body>
        <form id="challenge-form" action="/verify" method="POST">
            <input type="hidden" name="ray" value="r-123"/>
            <input type="hidden" name="challenge_answer" value=""/>
        </form>
        <div class="h-captcha" data-sitekey="10000000-aaaa-bbbb"></div>
        <script>document.getElementById('challenge_answer').value = 0;</script>
        </body></html>
    "#;

    struct StubProvider {
        name: &'static str,
        outcome: fn() -> CaptchaResult,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CaptchaProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn solve(&self, _task: &CaptchaTask) -> CaptchaResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    struct StubSession {
        cleared: bool,
        submissions: Vec<(Url, Vec<(String, String)>)>,
    }

    #[async_trait]
    impl SessionHandle for StubSession {
        async fn navigate(
            &mut self,
            url: &Url,
            _timeout: Duration,
        ) -> Result<Navigation, BrowserError> {
            Ok(Navigation {
                status: 200,
                final_url: url.clone(),
            })
        }

        async fn serialize(&mut self) -> Result<String, BrowserError> {
            if self.cleared {
                Ok("<html><body>member area</body></html>".to_string())
            } else {
                Ok(CAPTCHA_PAGE.to_string())
            }
        }

        async fn evaluate(&mut self, _script: &str) -> Result<serde_json::Value, BrowserError> {
            Ok(serde_json::Value::Null)
        }

        async fn submit_form(
            &mut self,
            action: &Url,
            fields: &[(String, String)],
        ) -> Result<Navigation, BrowserError> {
            self.submissions.push((action.clone(), fields.to_vec()));
            if fields
                .iter()
                .any(|(name, value)| name == "h-captcha-response" && value == "tok-ok")
            {
                self.cleared = true;
            }
            Ok(Navigation {
                status: 200,
                final_url: action.clone(),
            })
        }

        fn drain_intercepted(&mut self) -> Vec<Url> {
            Vec::new()
        }

        async fn close(&mut self) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    fn fast_config() -> SolverConfig {
        SolverConfig {
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(200),
            passive_wait: Duration::from_millis(20),
            backoff_base: Duration::from_millis(10),
            max_attempts: 3,
            navigation_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn falls_through_to_the_next_provider() {
        let failing = Arc::new(StubProvider {
            name: "failing",
            outcome: || Err(CaptchaError::Provider("balance exhausted".into())),
            calls: AtomicUsize::new(0),
        });
        let declining = Arc::new(StubProvider {
            name: "declining",
            outcome: || Ok(None),
            calls: AtomicUsize::new(0),
        });
        let solving = Arc::new(StubProvider {
            name: "solving",
            outcome: || Ok(Some(CaptchaSolution::new("tok-ok"))),
            calls: AtomicUsize::new(0),
        });
        let solver = CaptchaGateSolver::new(
            vec![failing.clone(), declining.clone(), solving.clone()],
            fast_config(),
        );
        let mut session = StubSession {
            cleared: false,
            submissions: Vec::new(),
        };
        let page_url = Url::parse("https://example.com/members").unwrap();

        let markup = solver
            .resolve(
                &mut session,
                &page_url,
                CAPTCHA_PAGE,
                CaptchaKind::Hcaptcha,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert!(markup.contains("member area"));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(declining.calls.load(Ordering::SeqCst), 1);
        assert_eq!(solving.calls.load(Ordering::SeqCst), 1);

        // Token was posted through the existing challenge form.
        let (action, fields) = &session.submissions[0];
        assert_eq!(action.path(), "/verify");
        assert!(fields.iter().any(|(name, _)| name == "ray"));
    }

    #[tokio::test]
    async fn exhausted_providers_fail_the_gate() {
        let failing = Arc::new(StubProvider {
            name: "failing",
            outcome: || Err(CaptchaError::Provider("down".into())),
            calls: AtomicUsize::new(0),
        });
        let solver = CaptchaGateSolver::new(vec![failing], fast_config());
        let mut session = StubSession {
            cleared: false,
            submissions: Vec::new(),
        };
        let page_url = Url::parse("https://example.com/").unwrap();

        let result = solver
            .resolve(
                &mut session,
                &page_url,
                CAPTCHA_PAGE,
                CaptchaKind::Hcaptcha,
                &CancelToken::new(),
            )
            .await;
        assert!(matches!(result, Err(CaptchaGateError::ProvidersExhausted)));
        assert!(session.submissions.is_empty());
    }

    #[tokio::test]
    async fn missing_site_key_is_reported() {
        let solving = Arc::new(StubProvider {
            name: "solving",
            outcome: || Ok(Some(CaptchaSolution::new("tok-ok"))),
            calls: AtomicUsize::new(0),
        });
        let solver = CaptchaGateSolver::new(vec![solving], fast_config());
        let mut session = StubSession {
            cleared: false,
            submissions: Vec::new(),
        };
        let page_url = Url::parse("https://example.com/").unwrap();

        let result = solver
            .resolve(
                &mut session,
                &page_url,
                "<html>no widget</html>",
                CaptchaKind::Hcaptcha,
                &CancelToken::new(),
            )
            .await;
        assert!(matches!(result, Err(CaptchaGateError::SiteKeyMissing)));
    }
}
