//! Application-wide constants.

/// Application name used in events and reports.
pub const APP_NAME: &str = "kiln";

/// Project discussion board.
pub const SUPPORT_DISCUSSIONS: &str = "https://github.com/kiln-tools/kiln/discussions";

/// Community chat server.
pub const SUPPORT_CHAT: &str = "https://discord.gg/kiln-tools";

/// Lifecycle state announced when a command starts executing.
pub const STATE_STARTED: &str = "started";

/// Lifecycle state announced when the command's main work is finished.
pub const STATE_COMPLETED: &str = "completed";

/// Lifecycle state announced right before a normal return.
pub const STATE_DONE: &str = "done";

/// Lifecycle state announced on abnormal termination, always with an exit code.
pub const STATE_EXITED: &str = "exited";
