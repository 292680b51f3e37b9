// pkv-common - Shared error and configuration types for PipeKV
//
// Every PipeKV crate reports failures through `PkvError` and is configured
// through `ClientConfig`, so both live here.

pub mod config;
pub mod error;

// Re-export for convenience
pub use config::*;
pub use error::*;
