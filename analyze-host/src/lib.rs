//! Analyze Host Library
//!
//! Loads the compiled request-analysis component and exposes its six exported
//! functions as typed Rust calls, with caller-overridable host imports.

pub mod abi;
pub mod analyzer;
pub mod convert;
pub mod engine;
pub mod error;
pub mod imports;
pub mod types;

// Re-export commonly used types
pub use analyzer::Analyzer;
pub use convert::MarshalError;
pub use engine::{AnalyzeComponent, AnalyzeConfig, ExecutionContext};
pub use error::{AnalyzeError, Result};
pub use imports::{
    BotIdentifier, BotVerifier, DefaultImports, EmailValidatorOverrides, HostImports, IpLookup,
    SensitiveInfoIdentifier,
};
pub use types::*;
