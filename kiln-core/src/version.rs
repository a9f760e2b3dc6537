//! Tool version and the asynchronous version check.
//!
//! The check runs as a concurrent task started at orchestration start; the
//! orchestrator awaits the result once, right before the `completed` to
//! `done` transition, so the added latency is bounded by the build itself.
//! The network probe is intentionally not implemented here; the task
//! resolves from the environment (`KILN_CHECK_LATEST` injects a latest
//! version, `KILN_NO_VERSION_CHECK` disables the check outright).

use tokio::sync::oneshot;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::ovars;

/// Current tool version.
pub fn current() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Result of the asynchronous version check.
#[derive(Debug, Clone, Default)]
pub struct VersionStatus {
    /// Whether the check actually ran.
    pub checked: bool,
    /// True when a newer release is available.
    pub outdated: bool,
    pub current: String,
    pub latest: Option<String>,
}

/// Start the version check as a concurrent task. The receiver delivers the
/// result exactly once.
pub fn check_async(
    enabled: bool,
    in_container: bool,
    is_kiln_image: bool,
) -> oneshot::Receiver<VersionStatus> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = check(enabled, in_container, is_kiln_image);
        let _ = tx.send(status);
    });
    rx
}

fn check(enabled: bool, in_container: bool, is_kiln_image: bool) -> VersionStatus {
    let mut status = VersionStatus { current: current().to_string(), ..Default::default() };

    if !enabled || std::env::var_os("KILN_NO_VERSION_CHECK").is_some() {
        debug!(in_container, is_kiln_image, "version check disabled");
        return status;
    }

    if let Ok(latest) = std::env::var("KILN_CHECK_LATEST") {
        status.checked = true;
        status.outdated = latest != status.current;
        status.latest = Some(latest);
    }

    status
}

/// Report the version check result through the event sink.
pub fn print_check_version(xc: &ExecutionContext, status: &VersionStatus) {
    if !status.checked {
        xc.out().info("version.check", ovars! {"status" => "skipped"});
        return;
    }

    if status.outdated {
        xc.out().info(
            "update.available",
            ovars! {
                "current" => &status.current,
                "latest" => status.latest.as_deref().unwrap_or("unknown"),
            },
        );
    } else {
        xc.out().info("version.check", ovars! {"status" => "current"});
    }
}

/// Emit the diagnostic version block printed under `--debug`.
pub fn print_version_info(xc: &ExecutionContext, in_container: bool, is_kiln_image: bool) {
    xc.out().info(
        "version",
        ovars! {
            "version" => current(),
            "in.container" => in_container,
            "is.kiln.image" => is_kiln_image,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_disabled_delivers_unchecked_status() {
        let rx = check_async(false, false, false);
        let status = rx.await.unwrap();
        assert!(!status.checked);
        assert!(!status.outdated);
        assert_eq!(status.current, current());
    }

    #[tokio::test]
    async fn test_check_with_injected_latest() {
        std::env::set_var("KILN_CHECK_LATEST", "99.0.0");
        let rx = check_async(true, false, false);
        let status = rx.await.unwrap();
        std::env::remove_var("KILN_CHECK_LATEST");

        assert!(status.checked);
        assert!(status.outdated);
        assert_eq!(status.latest.as_deref(), Some("99.0.0"));
    }
}
