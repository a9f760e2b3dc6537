//! Process exit codes.
//!
//! Exit codes are composed from a command-category tag bit-group and a
//! specific-cause bit-group. The composition is kept as an explicit
//! category + cause pair so individual codes stay inspectable in tests and
//! event payloads; `value()` produces the numeric form carried in the final
//! `exited` state event and the process exit status.

use std::fmt;

/// Command-type tag bit-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCategory {
    /// Normal fall-through termination.
    Success,
    /// Errors shared by all commands.
    Common,
}

impl ExitCategory {
    fn tag(self) -> i32 {
        match self {
            ExitCategory::Success => 0,
            ExitCategory::Common => 1 << 24,
        }
    }
}

/// Specific-cause bit-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    None,
    /// Generic hard failure; renders as -1 regardless of category.
    GenericFailure,
    NoDaemonConnectInfo,
    UnsupportedEngine,
    UnsupportedOutputFormat,
}

impl ExitCause {
    fn bits(self) -> i32 {
        match self {
            ExitCause::None => 0,
            ExitCause::GenericFailure => 0,
            ExitCause::NoDaemonConnectInfo => 1,
            ExitCause::UnsupportedEngine => 2,
            ExitCause::UnsupportedOutputFormat => 3,
        }
    }
}

/// A composed process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode {
    pub category: ExitCategory,
    pub cause: ExitCause,
}

impl ExitCode {
    /// Normal termination (0).
    pub const SUCCESS: ExitCode = ExitCode { category: ExitCategory::Success, cause: ExitCause::None };

    /// Generic hard failure (-1), used by `fail`/`fail_on`.
    pub const FAILURE: ExitCode =
        ExitCode { category: ExitCategory::Common, cause: ExitCause::GenericFailure };

    /// A common-category code with the given cause.
    pub const fn common(cause: ExitCause) -> ExitCode {
        ExitCode { category: ExitCategory::Common, cause }
    }

    /// Numeric value: category tag OR'd with the cause bits.
    pub fn value(&self) -> i32 {
        if self.cause == ExitCause::GenericFailure {
            return -1;
        }
        self.category.tag() | self.cause.bits()
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}
