//! Plain HTTP automation backend.
//!
//! Drives pages with a cookie-aware reqwest client instead of a real browser.
//! Serialization returns the fetched markup as-is and script evaluation runs
//! through the Boa interpreter; runtime request interception is unavailable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::external_deps::interpreters::{BoaJavascriptInterpreter, JavascriptInterpreter};

use super::{BrowserAutomation, BrowserError, Navigation, SessionHandle};

/// reqwest-backed [`BrowserAutomation`] implementation.
pub struct HttpBrowser {
    interpreter: Arc<dyn JavascriptInterpreter>,
    user_agent: String,
}

impl HttpBrowser {
    pub fn new() -> Self {
        Self {
            interpreter: Arc::new(BoaJavascriptInterpreter::new()),
            user_agent: concat!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) ",
                "AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0 Safari/537.36"
            )
            .to_string(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: Arc<dyn JavascriptInterpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl Default for HttpBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserAutomation for HttpBrowser {
    async fn open_session(
        &self,
        proxy: Option<&str>,
    ) -> Result<Box<dyn SessionHandle>, BrowserError> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(self.user_agent.clone());
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| BrowserError::Navigation(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| BrowserError::Navigation(err.to_string()))?;

        Ok(Box::new(HttpSession {
            client,
            interpreter: self.interpreter.clone(),
            current: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            open: true,
        }))
    }
}

struct CurrentPage {
    url: Url,
    body: String,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct HttpSession {
    client: reqwest::Client,
    interpreter: Arc<dyn JavascriptInterpreter>,
    current: Option<CurrentPage>,
    /// Deadline for follow-up requests, taken from the last navigation.
    timeout: Duration,
    open: bool,
}

impl HttpSession {
    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.open {
            Ok(())
        } else {
            Err(BrowserError::SessionClosed)
        }
    }

    async fn load(
        &mut self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<Navigation, BrowserError> {
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| BrowserError::Timeout(timeout))?
            .map_err(|err| BrowserError::Navigation(err.to_string()))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let body = tokio::time::timeout(timeout, response.text())
            .await
            .map_err(|_| BrowserError::Timeout(timeout))?
            .map_err(|err| BrowserError::Navigation(err.to_string()))?;

        self.current = Some(CurrentPage {
            url: final_url.clone(),
            body,
        });
        Ok(Navigation { status, final_url })
    }
}

#[async_trait]
impl SessionHandle for HttpSession {
    async fn navigate(&mut self, url: &Url, timeout: Duration) -> Result<Navigation, BrowserError> {
        self.ensure_open()?;
        self.timeout = timeout;
        let request = self.client.get(url.clone());
        self.load(request, timeout).await
    }

    async fn serialize(&mut self) -> Result<String, BrowserError> {
        self.ensure_open()?;
        self.current
            .as_ref()
            .map(|page| page.body.clone())
            .ok_or_else(|| BrowserError::Navigation("no page loaded".into()))
    }

    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.ensure_open()?;
        let host = self
            .current
            .as_ref()
            .and_then(|page| page.url.host_str())
            .unwrap_or("localhost")
            .to_string();
        let result = self
            .interpreter
            .execute(script, &host)
            .map_err(|err| BrowserError::Evaluation(err.to_string()))?;
        Ok(serde_json::Value::String(result))
    }

    async fn submit_form(
        &mut self,
        action: &Url,
        fields: &[(String, String)],
    ) -> Result<Navigation, BrowserError> {
        self.ensure_open()?;
        let timeout = self.timeout;
        let request = self.client.post(action.clone()).form(fields);
        self.load(request, timeout).await
    }

    fn drain_intercepted(&mut self) -> Vec<Url> {
        // HTTP sessions execute no page scripts, so there is nothing to intercept.
        Vec::new()
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.open = false;
        self.current = None;
        Ok(())
    }
}
