use async_trait::async_trait;

use super::{CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaTask};

/// Placeholder adapter for the AntiCaptcha service.
#[derive(Debug, Clone)]
pub struct AntiCaptchaProvider {
    pub api_key: String,
    pub config: CaptchaConfig,
}

impl AntiCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            config: CaptchaConfig::default(),
        }
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
        }
    }
}

#[async_trait]
impl CaptchaProvider for AntiCaptchaProvider {
    fn name(&self) -> &'static str {
        "anticaptcha"
    }

    async fn solve(&self, _task: &CaptchaTask) -> CaptchaResult {
        Err(CaptchaError::NotImplemented(self.name()))
    }
}
