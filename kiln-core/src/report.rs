//! Run summary reports.
//!
//! Each command persists a small JSON record of its run: the command name,
//! the lifecycle phase it reached, and environment flags. Saving is best
//! effort; a failed or disabled save never aborts the run.

use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::version;

/// Report location value that disables reporting.
pub const REPORT_OFF: &str = "off";

/// Lifecycle phase recorded in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Started,
    Completed,
    Done,
    Exited,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub state: CommandState,
    pub in_container: bool,
    pub version: String,
    pub date: chrono::DateTime<chrono::Utc>,
    #[serde(skip)]
    location: String,
}

impl CommandReport {
    /// `location` may be empty or [`REPORT_OFF`] to disable persistence.
    pub fn new(command: &str, location: &str, in_container: bool) -> Self {
        Self {
            command: command.to_string(),
            state: CommandState::Started,
            in_container,
            version: version::current().to_string(),
            date: chrono::Utc::now(),
            location: location.to_string(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Persist the report. Returns false when reporting is disabled or the
    /// write fails; the caller only announces the location on success.
    pub fn save(&self) -> bool {
        if self.location.is_empty() || self.location == REPORT_OFF {
            return false;
        }

        let rendered = match serde_json::to_string_pretty(self) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(error = %err, "failed to serialize command report");
                return false;
            }
        };

        if let Err(err) = std::fs::write(Path::new(&self.location), rendered) {
            warn!(error = %err, location = %self.location, "failed to save command report");
            return false;
        }

        true
    }
}
