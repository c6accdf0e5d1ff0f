use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{Instant, sleep};

use super::{
    CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaResult, CaptchaSolution,
    CaptchaTask,
};

const API_BASE: &str = "https://2captcha.com";

/// Adapter for the TwoCaptcha in.php/res.php API.
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    api_key: String,
    config: CaptchaConfig,
    client: reqwest::Client,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            client: reqwest::Client::new(),
        }
    }

    fn method(kind: CaptchaKind) -> &'static str {
        match kind {
            CaptchaKind::RecaptchaV2 => "userrecaptcha",
            CaptchaKind::Hcaptcha => "hcaptcha",
            CaptchaKind::Turnstile => "turnstile",
        }
    }

    fn key_param(kind: CaptchaKind) -> &'static str {
        match kind {
            CaptchaKind::RecaptchaV2 => "googlekey",
            CaptchaKind::Hcaptcha | CaptchaKind::Turnstile => "sitekey",
        }
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "twocaptcha"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        if self.api_key.is_empty() {
            return Err(CaptchaError::Configuration("missing api key".into()));
        }

        let submitted: Value = self
            .client
            .post(format!("{API_BASE}/in.php"))
            .query(&[
                ("key", self.api_key.as_str()),
                ("method", Self::method(task.kind)),
                (Self::key_param(task.kind), task.site_key.as_str()),
                ("pageurl", task.page_url.as_str()),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?
            .json()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?;

        if submitted["status"].as_i64().unwrap_or(0) != 1 {
            let reason = submitted["request"].as_str().unwrap_or("unknown");
            return Err(CaptchaError::Provider(reason.to_string()));
        }
        let Some(request_id) = submitted["request"].as_str().map(str::to_string) else {
            return Ok(None);
        };

        let deadline = Instant::now() + self.config.timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(CaptchaError::Timeout(self.config.timeout));
            }
            sleep(self.config.poll_interval).await;

            let result: Value = self
                .client
                .get(format!("{API_BASE}/res.php"))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", request_id.as_str()),
                    ("json", "1"),
                ])
                .send()
                .await
                .map_err(|err| CaptchaError::Provider(err.to_string()))?
                .json()
                .await
                .map_err(|err| CaptchaError::Provider(err.to_string()))?;

            if result["status"].as_i64().unwrap_or(0) == 1 {
                return Ok(result["request"].as_str().map(CaptchaSolution::new));
            }
            match result["request"].as_str() {
                Some("CAPCHA_NOT_READY") | None => continue,
                Some(other) => return Err(CaptchaError::Provider(other.to_string())),
            }
        }
    }
}
