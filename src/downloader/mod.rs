// Downloader module - platform detection, tiered extraction and transient storage

pub mod cleanup;
pub mod errors;
pub mod extractors;
pub mod format_selector;
pub mod materializer;
pub mod models;
pub mod orchestrator;
pub mod platform;
pub mod process;
pub mod rate_limit;
pub mod tools;
pub mod utils;

pub use cleanup::CleanupScheduler;
pub use errors::{ChainError, ChainExhausted, ExtractionError, ExtractionErrorKind, MaterializeError};
pub use materializer::Materializer;
pub use models::{AcquisitionRequest, ContentKind, ExtractionAttempt, ManagedFile, MediaFormat};
pub use orchestrator::{ChainOutcome, ChainRegistry, DegradedPolicy, FallbackChain};
pub use platform::{detect, Platform};
pub use process::{CommandRunner, TokioProcessRunner};
pub use rate_limit::RateLimiter;
pub use tools::ToolManager;
