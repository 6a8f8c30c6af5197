// Error types for every pipeline stage
//
// Using thiserror so each stage gets:
// - Type-safe error matching
// - Source error chaining
// - Display messages that carry the block/stage context

use std::time::Duration;
use thiserror::Error;

/// Configuration errors
///
/// These are the only translation-side errors that escape a run: they are
/// raised before any network call is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing credential: {0} is not set")]
    MissingCredential(&'static str),

    #[error("Batch size must be > 0, got {0}")]
    InvalidBatchSize(usize),

    #[error("Invalid rendering config: {0}")]
    InvalidRenderingConfig(String),

    #[error("Invalid output config: {0}")]
    InvalidOutputConfig(String),

    #[error("Unknown auth strategy '{0}' (expected 'form' or 'header')")]
    UnknownAuthStrategy(String),

    #[error("At least one auth strategy must be configured")]
    NoAuthStrategies,

    #[error("HTTP client construction failed: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("Environment variable parsing failed: {0}")]
    EnvVarError(String),
}

/// Text region detection errors, fatal to a run
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Input is not a decodable image: {0}")]
    UndecodableImage(#[source] image::ImageError),

    #[error("OCR request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("OCR service returned status {status}: {body}")]
    ServiceStatus { status: u16, body: String },

    #[error("OCR service error {code}: {message}")]
    ServiceError { code: i64, message: String },

    #[error("Invalid OCR response: {0}")]
    InvalidResponse(String),

    #[error("OCR call timed out after {0:?}")]
    Timeout(Duration),
}

/// Translation service errors
///
/// Always absorbed inside the batch translator (per-item fallback, then
/// original text); never surfaces past it.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Translation request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Translation service rejected credentials (status {status}): {body}")]
    PermissionDenied { status: u16, body: String },

    #[error("Translation service returned status {status}: {body}")]
    ServiceStatus { status: u16, body: String },

    #[error("Invalid translation response: {0}")]
    InvalidResponse(String),

    #[error("Mismatched translation count: got {got}, want {want}")]
    CountMismatch { got: usize, want: usize },

    #[error("Translation call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Missing credential for translation service")]
    MissingCredential,
}

impl TranslationError {
    /// Whether the next auth strategy should be tried
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TranslationError::PermissionDenied { .. })
    }
}

/// Patch rendering errors, recovered by skipping the block
#[derive(Debug, Error)]
pub enum RenderingError {
    #[error("Invalid canvas dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Font loading failed: {0}")]
    FontLoadError(String),

    #[error("Image encoding failed: {0}")]
    ImageError(#[from] image::ImageError),
}

/// Compositing errors, recovered by skipping the patch
#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("No patch image for block {block_id}")]
    MissingPatch { block_id: u32 },

    #[error("Patch image for block {block_id} could not be decoded: {source}")]
    UndecodablePatch {
        block_id: u32,
        #[source]
        source: image::ImageError,
    },
}

/// Run-level errors: the only outcomes where no image is produced
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Detection failed: {0}")]
    Detection(#[from] DetectionError),

    #[error("Run cancelled before {stage}")]
    Cancelled { stage: &'static str },

    #[error("Translation returned {got} texts for {want} blocks")]
    TranslationCountMismatch { got: usize, want: usize },

    #[error("Final image encoding failed: {0}")]
    EncodeFailed(#[source] image::ImageError),

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }
}

// Convenience type aliases for Results
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type DetectionResult<T> = Result<T, DetectionError>;
pub type TranslationResult<T> = Result<T, TranslationError>;
pub type RenderingResult<T> = Result<T, RenderingError>;
pub type CompositeResult<T> = Result<T, CompositeError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
