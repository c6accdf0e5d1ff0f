use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};

use super::{
    CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaResult, CaptchaSolution,
    CaptchaTask,
};

const API_BASE: &str = "https://api.capsolver.com";

/// Adapter for the CapSolver createTask/getTaskResult API.
#[derive(Debug, Clone)]
pub struct CapSolverProvider {
    api_key: String,
    config: CaptchaConfig,
    client: reqwest::Client,
}

impl CapSolverProvider {
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

    fn task_type(kind: CaptchaKind) -> &'static str {
        match kind {
            CaptchaKind::RecaptchaV2 => "ReCaptchaV2TaskProxyLess",
            CaptchaKind::Hcaptcha => "HCaptchaTaskProxyLess",
            CaptchaKind::Turnstile => "AntiTurnstileTaskProxyLess",
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, CaptchaError> {
        let response = self
            .client
            .post(format!("{API_BASE}{path}"))
            .json(&body)
            .send()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))
    }
}

#[async_trait]
impl CaptchaProvider for CapSolverProvider {
    fn name(&self) -> &'static str {
        "capsolver"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        if self.api_key.is_empty() {
            return Err(CaptchaError::Configuration("missing api key".into()));
        }

        let created = self
            .post(
                "/createTask",
                json!({
                    "clientKey": self.api_key,
                    "task": {
                        "type": Self::task_type(task.kind),
                        "websiteURL": task.page_url.as_str(),
                        "websiteKey": task.site_key,
                    }
                }),
            )
            .await?;

        if created["errorId"].as_i64().unwrap_or(0) != 0 {
            let description = created["errorDescription"].as_str().unwrap_or("unknown");
            return Err(CaptchaError::Provider(description.to_string()));
        }
        let Some(task_id) = created["taskId"].as_str().map(str::to_string) else {
            return Ok(None);
        };

        let deadline = Instant::now() + self.config.timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(CaptchaError::Timeout(self.config.timeout));
            }
            sleep(self.config.poll_interval).await;

            let result = self
                .post(
                    "/getTaskResult",
                    json!({ "clientKey": self.api_key, "taskId": task_id }),
                )
                .await?;

            match result["status"].as_str() {
                Some("ready") => {
                    let token = result["solution"]["gRecaptchaResponse"]
                        .as_str()
                        .or_else(|| result["solution"]["token"].as_str());
                    return Ok(token.map(CaptchaSolution::new));
                }
                Some("processing") | None => continue,
                Some(other) => {
                    return Err(CaptchaError::Provider(format!("task status {other}")));
                }
            }
        }
    }
}
