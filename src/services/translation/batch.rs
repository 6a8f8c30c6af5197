// Batched translation with per-item fallback
//
// Texts are split into contiguous batches, one combined call each. A failed
// batch is retried item by item, and an item that still fails keeps its
// source text. Only a missing credential escapes as an error.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::core::config::TranslationConfig;
use crate::core::errors::{ConfigError, ConfigResult, TranslationError, TranslationResult};
use crate::core::types::{TranslationOutcome, TranslationPath};
use crate::services::translation::deepl::{DeepLClient, TranslationBackend};
use crate::utils::metrics::{Metrics, Service};

pub struct BatchTranslator {
    backend: Arc<dyn TranslationBackend>,
    config: TranslationConfig,
    metrics: Option<Metrics>,
}

impl BatchTranslator {
    pub fn new(
        config: TranslationConfig,
        backend: Arc<dyn TranslationBackend>,
        metrics: Option<Metrics>,
    ) -> ConfigResult<Self> {
        if config.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(config.batch_size));
        }
        Ok(Self {
            backend,
            config,
            metrics,
        })
    }

    /// Batch translator over the DeepL HTTP API
    pub fn deepl(config: TranslationConfig, metrics: Option<Metrics>) -> ConfigResult<Self> {
        let client = DeepLClient::new(&config)?;
        Self::new(config, Arc::new(client), metrics)
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Translate `texts`, returning exactly one string per input in order.
    pub async fn translate_batch(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> ConfigResult<Vec<String>> {
        Ok(self
            .translate_batch_detailed(texts, source_lang, target_lang)
            .await?
            .into_iter()
            .map(|o| o.text)
            .collect())
    }

    /// Like [`translate_batch`](Self::translate_batch) but records how each
    /// item was obtained.
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    pub async fn translate_batch_detailed(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> ConfigResult<Vec<TranslationOutcome>> {
        if self.config.credential().is_none() {
            return Err(ConfigError::MissingCredential("DEEPL_API_KEY"));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let source = source_lang.trim().to_uppercase();
        let target = target_lang.trim().to_uppercase();
        let start = Instant::now();
        let batch_count = texts.len().div_ceil(self.config.batch_size);

        let mut outcomes = Vec::with_capacity(texts.len());
        for (index, chunk) in texts.chunks(self.config.batch_size).enumerate() {
            if index > 0 && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            debug!("Batch {}/{}: {} texts", index + 1, batch_count, chunk.len());
            outcomes.extend(self.translate_chunk(chunk, &source, &target).await);
        }

        let degraded = outcomes.iter().filter(|o| o.degraded()).count();
        if degraded > 0 {
            warn!(
                "{} of {} texts kept their original text",
                degraded,
                outcomes.len()
            );
        }
        info!(
            "Translated {} texts in {} batches ({:.0}ms)",
            outcomes.len(),
            batch_count,
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(outcomes)
    }

    async fn translate_chunk(
        &self,
        chunk: &[String],
        source: &str,
        target: &str,
    ) -> Vec<TranslationOutcome> {
        match self.call(chunk, source, target).await {
            Ok(translated) => {
                return translated
                    .into_iter()
                    .map(|text| TranslationOutcome {
                        text,
                        path: TranslationPath::Batch,
                    })
                    .collect()
            }
            Err(e) => warn!("Batch of {} failed, retrying per item: {}", chunk.len(), e),
        }

        let mut outcomes = Vec::with_capacity(chunk.len());
        for original in chunk {
            let outcome = match self
                .call(std::slice::from_ref(original), source, target)
                .await
            {
                Ok(mut translated) => TranslationOutcome {
                    text: translated.remove(0),
                    path: TranslationPath::Fallback,
                },
                Err(e) => {
                    warn!("Keeping original text for {:?}: {}", original, e);
                    TranslationOutcome {
                        text: original.clone(),
                        path: TranslationPath::Original,
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// One bounded backend call whose result count is verified
    async fn call(
        &self,
        texts: &[String],
        source: &str,
        target: &str,
    ) -> TranslationResult<Vec<String>> {
        let start = Instant::now();
        let timeout: Duration = self.config.timeout;

        let result = match tokio::time::timeout(
            timeout,
            self.backend.translate(texts, source, target),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TranslationError::Timeout(timeout)),
        }
        .and_then(|translated| {
            if translated.len() == texts.len() {
                Ok(translated)
            } else {
                Err(TranslationError::CountMismatch {
                    got: translated.len(),
                    want: texts.len(),
                })
            }
        });

        if let Some(ref m) = self.metrics {
            m.record_api_call(Service::Translation, result.is_ok(), start.elapsed());
        }
        result
    }
}
