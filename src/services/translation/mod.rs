pub mod batch;
pub mod deepl;

pub use batch::BatchTranslator;
pub use deepl::{AuthStrategy, DeepLClient, TranslationBackend};
