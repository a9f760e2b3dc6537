//! The image build orchestrator.
//!
//! Runs one build invocation end to end: announces the `started` state,
//! dispatches to the selected engine (bootstrapping only the clients that
//! engine needs, memoized so a later runtime-load reuses an open daemon
//! connection), fans the produced archive out to the requested local
//! runtimes, optionally pushes to a registry, and closes the
//! `started -> completed -> done` lifecycle after joining the version-check
//! task. Every fallible step funnels through the execution context's
//! termination paths; there are no local retries.

use std::sync::Arc;

use crate::consts::{STATE_COMPLETED, STATE_DONE, STATE_EXITED, STATE_STARTED};
use crate::context::ExecutionContext;
use crate::engine::{self, BuildParams, ClientProvider, DaemonApi, GenericParams};
use crate::exitcode::{ExitCause, ExitCode};
use crate::ovars;
use crate::report::{CommandReport, CommandState};
use crate::{paths, version};

pub const COMMAND_NAME: &str = "build";

/// Execute the build command. Does not return on failure; all error paths
/// terminate through the execution context.
pub async fn run(
    xc: &ExecutionContext,
    gparams: &GenericParams,
    cparams: &BuildParams,
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
        ovars! {"cparams" => serde_json::to_string(cparams).unwrap_or_default()},
    );

    let mut dclient: Option<Arc<dyn DaemonApi>> = None;
    let mut pclient: Option<Arc<dyn DaemonApi>> = None;

    let archive = match cparams.engine.as_str() {
        engine::DOCKER_ENGINE => {
            let client = init_docker_client(xc, gparams, provider).await;
            dclient = Some(client.clone());

            if gparams.debug {
                version::print_version_info(xc, gparams.in_container, gparams.is_kiln_image);
            }

            xc.fail_on(client.build(cparams, xc.out()).await)
        }
        engine::PODMAN_ENGINE => {
            let client = init_podman_client(xc, provider).await;
            pclient = Some(client.clone());

            if gparams.debug {
                version::print_version_info(xc, gparams.in_container, gparams.is_kiln_image);
            }

            xc.fail_on(client.build(cparams, xc.out()).await)
        }
        engine::BUILDKIT_ENGINE | engine::DEPOT_ENGINE => {
            if gparams.debug {
                version::print_version_info(xc, gparams.in_container, gparams.is_kiln_image);
            }

            let builder = xc.fail_on(provider.remote_builder(&cparams.engine, cparams));
            xc.fail_on(builder.build(cparams, xc.out()).await)
        }
        engine::SIMPLE_ENGINE => {
            if gparams.debug {
                version::print_version_info(xc, gparams.in_container, gparams.is_kiln_image);
            }

            xc.fail_on(provider.simple_builder().build(cparams, xc.out()).await)
        }
        unsupported => {
            xc.out().error("engine", "unsupported engine");
            let code = ExitCode::common(ExitCause::UnsupportedEngine);
            xc.out().state(
                STATE_EXITED,
                ovars! {
                    "exit.code" => code,
                    "version" => version::current(),
                    "location" => paths::exe_dir(),
                    "engine" => unsupported,
                },
            );
            xc.exit(code)
        }
    };

    // Runtime-load fan-out, reusing already-open daemon connections.
    // Each runtime loads at most once however often it was requested.
    let mut loaders: Vec<(String, Arc<dyn DaemonApi>)> = Vec::new();
    for runtime in &cparams.load_runtimes {
        if loaders.iter().any(|(name, _)| name == runtime) {
            continue;
        }
        match runtime.as_str() {
            engine::DOCKER_RUNTIME => {
                let client = match &dclient {
                    Some(client) => client.clone(),
                    None => {
                        let client = init_docker_client(xc, gparams, provider).await;
                        dclient = Some(client.clone());
                        client
                    }
                };
                loaders.push((runtime.clone(), client));
            }
            engine::PODMAN_RUNTIME => {
                let client = match &pclient {
                    Some(client) => client.clone(),
                    None => {
                        let client = init_podman_client(xc, provider).await;
                        pclient = Some(client.clone());
                        client
                    }
                };
                loaders.push((runtime.clone(), client));
            }
            _ => {}
        }
    }

    if loaders.is_empty() {
        xc.out().info("runtime.load.image.none", None);
    } else {
        for (runtime, client) in &loaders {
            xc.out().info(
                "runtime.load.image",
                ovars! {
                    "runtime" => runtime,
                    "image.archive.file" => archive.display(),
                },
            );

            // The image is already resident in the runtime that built it.
            if *runtime == cparams.engine {
                xc.out().info("same.image.engine.runtime", None);
            } else {
                xc.fail_on(client.load_image(&archive, xc.out()).await);
            }
        }
    }

    if cparams.registry_push {
        let registry = provider.registry();
        let creds = xc.fail_on(
            registry
                .configure_auth(
                    cparams.use_docker_creds,
                    &cparams.creds_account,
                    &cparams.creds_secret,
                )
                .await,
        );
        xc.fail_on(registry.push_from_archive(&archive, &cparams.image_name, &creds).await);
    }

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

/// Bootstrap the Docker daemon client. Missing connection info is not a
/// generic failure: it gets a targeted remediation message (the
/// container-specific variant when running inside the kiln image) and the
/// distinguished no-connection exit code.
async fn init_docker_client(
    xc: &ExecutionContext,
    gparams: &GenericParams,
    provider: &dyn ClientProvider,
) -> Arc<dyn DaemonApi> {
    match provider.docker_daemon().await {
        Ok(client) => client,
        Err(err) if err.is_no_connect_info() => {
            let exit_msg = if gparams.in_container && gparams.is_kiln_image {
                "make sure to pass the Docker connect parameters to the kiln container"
            } else {
                "missing Docker connection info"
            };
            // Info, not error: subscribers must still get the remediation.
            xc.out().info("docker.connect.error", ovars! {"message" => exit_msg});

            let code = ExitCode::common(ExitCause::NoDaemonConnectInfo);
            xc.out().state(
                STATE_EXITED,
                ovars! {
                    "exit.code" => code,
                    "version" => version::current(),
                    "location" => paths::exe_dir(),
                },
            );
            xc.exit(code)
        }
        Err(err) => xc.fail_on::<Arc<dyn DaemonApi>, _>(Err(err)),
    }
}

async fn init_podman_client(
    xc: &ExecutionContext,
    provider: &dyn ClientProvider,
) -> Arc<dyn DaemonApi> {
    match provider.podman_daemon().await {
        Ok(client) => client,
        Err(err) => {
            xc.out().info("podman.connect.service", ovars! {"message" => "not running"});
            xc.out().state(
                STATE_EXITED,
                ovars! {
                    "exit.code" => ExitCode::FAILURE,
                    "version" => version::current(),
                    "location" => paths::exe_dir(),
                    "podman.error" => err,
                },
            );
            xc.exit(ExitCode::FAILURE)
        }
    }
}
