pub mod classifier;
pub mod extractor;
pub mod gmail;

pub use classifier::OpenAiClassifier;
pub use extractor::AlertExtractor;
pub use gmail::GmailSource;
