use crate::core::errors::{ConfigError, ConfigResult};
use crate::services::translation::AuthStrategy;
use crate::utils::image_ops::OutputFormat;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_VISION_URL: &str = "https://vision.googleapis.com/v1/images:annotate";
pub const DEFAULT_DEEPL_URL: &str = "https://api-free.deepl.com/v2/translate";

/// OCR collaborator configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_VISION_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Translation collaborator and batching configuration
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub auth_key: Option<String>,
    pub endpoint: String,
    /// Maximum texts per combined request
    pub batch_size: usize,
    /// Fixed pause between consecutive batches
    pub batch_delay: Duration,
    /// Bound on every single request
    pub timeout: Duration,
    /// Tried in order; the next one is used only after a permission-denied reply
    pub auth_strategies: Vec<AuthStrategy>,
}

impl TranslationConfig {
    /// Credential with surrounding whitespace removed, `None` when blank
    pub fn credential(&self) -> Option<&str> {
        self.auth_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            auth_key: None,
            endpoint: DEFAULT_DEEPL_URL.to_string(),
            batch_size: 20,
            batch_delay: Duration::from_millis(200),
            timeout: Duration::from_secs(30),
            auth_strategies: vec![AuthStrategy::FormKey, AuthStrategy::Header],
        }
    }
}

/// Patch rendering configuration
#[derive(Debug, Clone)]
pub struct RenderingConfig {
    /// Optional font file; system fonts are used when absent
    pub font_path: Option<PathBuf>,
    pub min_font_size: f32,
    pub max_font_size: f32,
    /// Patch canvas = bbox size scaled by these factors
    pub canvas_scale_x: f32,
    pub canvas_scale_y: f32,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            min_font_size: 12.0,
            max_font_size: 48.0,
            canvas_scale_x: 1.6,
            canvas_scale_y: 1.2,
        }
    }
}

/// Output encoding and language defaults
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub source_lang: String,
    pub target_lang: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg { quality: 90 },
            source_lang: "ja".to_string(),
            target_lang: "en".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_level: Level,
}

/// Main application configuration
///
/// Only the binary reads the environment; library components receive the
/// sub-config they need through their constructors.
#[derive(Debug, Clone)]
pub struct Config {
    pub detection: DetectionConfig,
    pub translation: TranslationConfig,
    pub rendering: RenderingConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn new() -> ConfigResult<Self> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> ConfigResult<Self> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let auth_strategies = match env::var("TRANSLATION_AUTH_ORDER") {
            Ok(order) => parse_auth_order(&order)?,
            Err(_) => TranslationConfig::default().auth_strategies,
        };

        let format = match env::var("OUTPUT_FORMAT")
            .unwrap_or_else(|_| "jpeg".to_string())
            .to_lowercase()
            .as_str()
        {
            "png" => OutputFormat::Png,
            "jpeg" | "jpg" => OutputFormat::Jpeg {
                quality: env_or("JPEG_QUALITY", 90u8)?,
            },
            other => {
                return Err(ConfigError::InvalidOutputConfig(format!(
                    "OUTPUT_FORMAT must be 'jpeg' or 'png', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            detection: DetectionConfig {
                api_key: non_empty_var("VISION_API_KEY"),
                endpoint: env::var("VISION_API_URL")
                    .unwrap_or_else(|_| DEFAULT_VISION_URL.to_string()),
                timeout: Duration::from_secs(env_or("DETECTION_TIMEOUT_SECONDS", 60u64)?),
            },
            translation: TranslationConfig {
                auth_key: non_empty_var("DEEPL_API_KEY"),
                endpoint: env::var("DEEPL_API_URL")
                    .unwrap_or_else(|_| DEFAULT_DEEPL_URL.to_string()),
                batch_size: env_or("TRANSLATION_BATCH_SIZE", 20usize)?,
                batch_delay: Duration::from_millis(env_or("TRANSLATION_BATCH_DELAY_MS", 200u64)?),
                timeout: Duration::from_secs(env_or("TRANSLATION_TIMEOUT_SECONDS", 30u64)?),
                auth_strategies,
            },
            rendering: RenderingConfig {
                font_path: non_empty_var("FONT_PATH").map(PathBuf::from),
                min_font_size: env_or("FONT_MIN_SIZE", 12.0f32)?,
                max_font_size: env_or("FONT_MAX_SIZE", 48.0f32)?,
                canvas_scale_x: env_or("CANVAS_SCALE_X", 1.6f32)?,
                canvas_scale_y: env_or("CANVAS_SCALE_Y", 1.2f32)?,
            },
            output: OutputConfig {
                format,
                source_lang: env::var("SOURCE_LANG").unwrap_or_else(|_| "ja".to_string()),
                target_lang: env::var("TARGET_LANG").unwrap_or_else(|_| "en".to_string()),
            },
            logging: LoggingConfig { log_level },
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.translation.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(self.translation.batch_size));
        }

        if self.translation.auth_strategies.is_empty() {
            return Err(ConfigError::NoAuthStrategies);
        }

        let r = &self.rendering;
        if r.min_font_size <= 0.0 || r.min_font_size > r.max_font_size {
            return Err(ConfigError::InvalidRenderingConfig(format!(
                "font size bounds must satisfy 0 < min <= max, got {}..{}",
                r.min_font_size, r.max_font_size
            )));
        }

        if r.canvas_scale_x <= 0.0 || r.canvas_scale_y <= 0.0 {
            return Err(ConfigError::InvalidRenderingConfig(format!(
                "canvas scale factors must be > 0, got {}x{}",
                r.canvas_scale_x, r.canvas_scale_y
            )));
        }

        if let Some(path) = &r.font_path {
            if !path.exists() {
                return Err(ConfigError::InvalidRenderingConfig(format!(
                    "font file does not exist: {}",
                    path.display()
                )));
            }
        }

        if let OutputFormat::Jpeg { quality } = self.output.format {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::InvalidOutputConfig(format!(
                    "JPEG quality must be between 1 and 100, got {}",
                    quality
                )));
            }
        }

        if self.output.target_lang.trim().is_empty() {
            return Err(ConfigError::InvalidOutputConfig(
                "target language must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn log_level(&self) -> Level {
        self.logging.log_level
    }
}

/// Parse a comma-separated auth order such as `form,header`
pub fn parse_auth_order(order: &str) -> ConfigResult<Vec<AuthStrategy>> {
    order
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse())
        .collect()
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> ConfigResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::EnvVarError(format!("{}={:?} is not valid", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            detection: DetectionConfig::default(),
            translation: TranslationConfig::default(),
            rendering: RenderingConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig {
                log_level: Level::INFO,
            },
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.translation.batch_size, 20);
        assert_eq!(config.translation.batch_delay, Duration::from_millis(200));
        assert_eq!(config.output.format, OutputFormat::Jpeg { quality: 90 });
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = config();
        config.translation.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBatchSize(0))
        ));
    }

    #[test]
    fn test_inverted_font_bounds_rejected() {
        let mut config = config();
        config.rendering.min_font_size = 50.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRenderingConfig(_))
        ));
    }

    #[test]
    fn test_parse_auth_order() {
        assert_eq!(
            parse_auth_order("header, form").unwrap(),
            vec![AuthStrategy::Header, AuthStrategy::FormKey]
        );
        assert!(matches!(
            parse_auth_order("form,cookie"),
            Err(ConfigError::UnknownAuthStrategy(_))
        ));
    }

    #[test]
    fn test_blank_credential_is_absent() {
        let mut translation = TranslationConfig::default();
        translation.auth_key = Some("   ".to_string());
        assert_eq!(translation.credential(), None);
        translation.auth_key = Some(" abc:fx ".to_string());
        assert_eq!(translation.credential(), Some("abc:fx"));
    }
}
