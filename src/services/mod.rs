pub mod compositing;
pub mod detection;
pub mod rendering;
pub mod translation;

// Re-export commonly used services
pub use compositing::{CompositeOutcome, ImageCompositor, PatchImage, Placement};
pub use detection::{TextRegionDetector, VisionDetector};
pub use rendering::{wrap_lines, TextImageRenderer, TextMeasure};
pub use translation::{AuthStrategy, BatchTranslator, DeepLClient, TranslationBackend};
