//! The image push command.
//!
//! Retags an existing image into a registry: pulls the source reference
//! into a temporary docker-save archive, then pushes it under the target
//! tag. The temporary archive is removed through the execution context's
//! cleanup list, so it is cleaned up on failure paths too.

use crate::consts::{STATE_COMPLETED, STATE_DONE, STATE_STARTED};
use crate::context::ExecutionContext;
use crate::engine::{ClientProvider, GenericParams};
use crate::ovars;
use crate::report::{CommandReport, CommandState};
use crate::version;

pub const COMMAND_NAME: &str = "push";

/// Push command inputs.
#[derive(Debug, Default, Clone)]
pub struct PushParams {
    /// Source image reference.
    pub target_ref: String,
    /// Tag to push under; the source reference is reused when empty.
    pub as_tag: String,
    pub use_docker_creds: bool,
    pub creds_account: String,
    pub creds_secret: String,
}

pub async fn run(
    xc: &ExecutionContext,
    gparams: &GenericParams,
    cparams: &PushParams,
    provider: &dyn ClientProvider,
) {
    let vi_rx =
        version::check_async(gparams.check_version, gparams.in_container, gparams.is_kiln_image);

    let mut report =
        CommandReport::new(COMMAND_NAME, &gparams.report_location, gparams.in_container);
    report.state = CommandState::Started;

    xc.out().state(STATE_STARTED, None);
    xc.out().info(
        "cmd.input.params",
        ovars! {"target" => &cparams.target_ref, "as.tag" => &cparams.as_tag},
    );

    if gparams.debug {
        version::print_version_info(xc, gparams.in_container, gparams.is_kiln_image);
    }

    let registry = provider.registry();
    let creds = xc.fail_on(
        registry
            .configure_auth(cparams.use_docker_creds, &cparams.creds_account, &cparams.creds_secret)
            .await,
    );

    let archive_path =
        std::env::temp_dir().join(format!("kiln-saved-image-{}.tar", std::process::id()));
    {
        let archive_path = archive_path.clone();
        xc.add_cleanup_handler(move || {
            let _ = std::fs::remove_file(&archive_path);
        });
    }

    xc.out().info(
        "image.save",
        ovars! {"image" => &cparams.target_ref, "image.archive.file" => archive_path.display()},
    );
    xc.fail_on(registry.save_to_archive(&cparams.target_ref, &archive_path, &creds).await);

    let push_ref =
        if cparams.as_tag.is_empty() { cparams.target_ref.clone() } else { cparams.as_tag.clone() };
    xc.out().info("image.push", ovars! {"image" => &push_ref});
    xc.fail_on(registry.push_from_archive(&archive_path, &push_ref, &creds).await);
    let _ = std::fs::remove_file(&archive_path);

    xc.out().state(STATE_COMPLETED, None);
    report.state = CommandState::Completed;

    let vinfo = vi_rx.await.unwrap_or_default();
    version::print_check_version(xc, &vinfo);

    xc.out().state(STATE_DONE, None);
    report.state = CommandState::Done;
    if report.save() {
        xc.out().info("report", ovars! {"file" => report.location()});
    }
}
