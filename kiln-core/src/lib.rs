//! Kiln Core Library
//!
//! Shared execution context, structured output, engine clients, and build
//! orchestration for the kiln container-image tooling CLI.

pub mod build;
pub mod consts;
pub mod context;
pub mod engine;
pub mod error;
pub mod exitcode;
pub mod paths;
pub mod push;
pub mod registry;
pub mod report;
pub mod version;

// Re-export commonly used items
pub use context::output::{OutMessage, OutVars, Output, OutputFormat};
pub use context::ExecutionContext;
pub use error::{KilnError, Result};
pub use exitcode::{ExitCategory, ExitCause, ExitCode};
