use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::core::config::TranslationConfig;
use crate::core::errors::{
    ConfigError, ConfigResult, TranslationError, TranslationResult,
};

/// Transport for one translation call.
///
/// Implementations return one translation per input text, in order. The
/// batch translator verifies the count and owns retries, timeouts and pacing.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    /// `source_lang` may be empty (auto-detect); both codes arrive upper-cased.
    async fn translate(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> TranslationResult<Vec<String>>;
}

/// Where the credential is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// `auth_key` form field
    FormKey,
    /// `Authorization: DeepL-Auth-Key <key>` header
    Header,
}

impl FromStr for AuthStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "form" | "form_key" => Ok(AuthStrategy::FormKey),
            "header" => Ok(AuthStrategy::Header),
            other => Err(ConfigError::UnknownAuthStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeepLResponse {
    translations: Vec<DeepLTranslation>,
}

#[derive(Debug, Deserialize)]
struct DeepLTranslation {
    text: String,
}

/// DeepL v2 `/translate` client
pub struct DeepLClient {
    http_client: reqwest::Client,
    endpoint: String,
    auth_key: Option<String>,
    strategies: Vec<AuthStrategy>,
}

impl DeepLClient {
    pub fn new(config: &TranslationConfig) -> ConfigResult<Self> {
        if config.auth_strategies.is_empty() {
            return Err(ConfigError::NoAuthStrategies);
        }

        // Per-call deadlines are applied by the batch translator
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            auth_key: config.credential().map(str::to_string),
            strategies: config.auth_strategies.clone(),
        })
    }

    async fn send(
        &self,
        strategy: AuthStrategy,
        auth_key: &str,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> TranslationResult<Vec<String>> {
        let mut form: Vec<(&str, &str)> = Vec::with_capacity(texts.len() + 3);
        if strategy == AuthStrategy::FormKey {
            form.push(("auth_key", auth_key));
        }
        if !source_lang.is_empty() {
            form.push(("source_lang", source_lang));
        }
        form.push(("target_lang", target_lang));
        form.extend(texts.iter().map(|t| ("text", t.as_str())));

        let mut request = self.http_client.post(&self.endpoint).form(&form);
        if strategy == AuthStrategy::Header {
            request = request.header(AUTHORIZATION, format!("DeepL-Auth-Key {}", auth_key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default().trim().to_string();
            return Err(if status == StatusCode::FORBIDDEN {
                TranslationError::PermissionDenied {
                    status: status.as_u16(),
                    body,
                }
            } else {
                TranslationError::ServiceStatus {
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let text = response.text().await?;
        let parsed: DeepLResponse = serde_json::from_str(&text)
            .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;

        Ok(parsed.translations.into_iter().map(|t| t.text).collect())
    }
}

#[async_trait]
impl TranslationBackend for DeepLClient {
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn translate(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> TranslationResult<Vec<String>> {
        let auth_key = self
            .auth_key
            .as_deref()
            .ok_or(TranslationError::MissingCredential)?;

        let mut denied = None;
        for &strategy in &self.strategies {
            match self
                .send(strategy, auth_key, texts, source_lang, target_lang)
                .await
            {
                Ok(translations) => {
                    debug!("{:?} auth accepted", strategy);
                    return Ok(translations);
                }
                Err(e) if e.is_permission_denied() => {
                    warn!("{:?} auth rejected, trying next strategy", strategy);
                    denied = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(denied.unwrap_or(TranslationError::MissingCredential))
    }
}
