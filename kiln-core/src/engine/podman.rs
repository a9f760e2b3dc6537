//! Native Podman/Buildah daemon client.
//!
//! Connection resolution order: explicit connection URI, `CONTAINER_HOST`,
//! then the rootless and system podman sockets. Unlike Docker, a missing
//! podman service reports as "not running" and terminates with the generic
//! failure code.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::context::output::Output;
use crate::engine::{run_tool, BuildParams, ImageBuilder, ImageLoader, PODMAN_RUNTIME};
use crate::error::{KilnError, Result};
use crate::ovars;

pub struct PodmanDaemonClient {
    connection: Option<String>,
}

impl PodmanDaemonClient {
    pub fn connect(connection: Option<&str>) -> Result<Self> {
        if let Some(uri) = connection.filter(|c| !c.is_empty()) {
            debug!(uri, "using explicit podman connection");
            return Ok(Self { connection: Some(uri.to_string()) });
        }

        if let Ok(host) = std::env::var("CONTAINER_HOST") {
            if !host.is_empty() {
                debug!(host, "using CONTAINER_HOST podman connection");
                return Ok(Self { connection: Some(host) });
            }
        }

        let rootless = std::env::var("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("podman").join("podman.sock"))
            .ok();
        let candidates =
            rootless.into_iter().chain([PathBuf::from("/run/podman/podman.sock")]);
        for socket in candidates {
            if socket.exists() {
                debug!(socket = %socket.display(), "found podman socket");
                return Ok(Self { connection: None });
            }
        }

        Err(KilnError::DaemonConnectFailed {
            runtime: PODMAN_RUNTIME.to_string(),
            reason: "not running".to_string(),
        })
    }

    fn envs(&self) -> Vec<(String, String)> {
        self.connection
            .iter()
            .map(|uri| ("CONTAINER_HOST".to_string(), uri.clone()))
            .collect()
    }
}

#[async_trait]
impl ImageBuilder for PodmanDaemonClient {
    async fn build(&self, params: &BuildParams, out: &Output) -> Result<PathBuf> {
        let mut args = vec![
            "build".to_string(),
            "--platform".to_string(),
            format!("linux/{}", params.architecture),
            "-t".to_string(),
            params.image_name.clone(),
            "-f".to_string(),
            params.dockerfile.clone(),
        ];
        for (key, value) in &params.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &params.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(params.context_dir.clone());

        let log = run_tool("podman", &args, &self.envs()).await.map_err(|e| {
            KilnError::BuildFailed { engine: PODMAN_RUNTIME.to_string(), reason: e.to_string() }
        })?;
        out.log_dump("engine.podman.build", &log, ovars! {"image" => &params.image_name});

        let save_args = vec![
            "save".to_string(),
            "-o".to_string(),
            params.image_archive_file.clone(),
            params.image_name.clone(),
        ];
        run_tool("podman", &save_args, &self.envs()).await.map_err(|e| {
            KilnError::BuildFailed { engine: PODMAN_RUNTIME.to_string(), reason: e.to_string() }
        })?;

        Ok(PathBuf::from(&params.image_archive_file))
    }
}

#[async_trait]
impl ImageLoader for PodmanDaemonClient {
    async fn load_image(&self, archive: &Path, out: &Output) -> Result<()> {
        let args =
            vec!["load".to_string(), "-i".to_string(), archive.to_string_lossy().to_string()];
        let log = run_tool("podman", &args, &self.envs()).await.map_err(|e| {
            KilnError::LoadFailed { runtime: PODMAN_RUNTIME.to_string(), reason: e.to_string() }
        })?;
        out.log_dump(
            "runtime.podman.load",
            &log,
            ovars! {"image.archive.file" => archive.display()},
        );

        Ok(())
    }
}
