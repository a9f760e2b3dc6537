//! Native Docker daemon client.
//!
//! Connection info is resolved up front (`DOCKER_HOST` or the default unix
//! socket); missing info is the distinguished no-connection error so the
//! orchestrator can emit its targeted remediation message instead of the
//! generic failure path. Build/save/load are delegated to the docker CLI
//! and the raw tool output is re-emitted through the event sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::context::output::Output;
use crate::engine::{run_tool, BuildParams, ImageBuilder, ImageLoader, DOCKER_RUNTIME};
use crate::error::{KilnError, Result};
use crate::ovars;

/// Default daemon socket probed when `DOCKER_HOST` is unset.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub struct DockerDaemonClient {
    host: Option<String>,
}

impl DockerDaemonClient {
    pub fn connect() -> Result<Self> {
        let host = std::env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty());
        if host.is_none() && !Path::new(DOCKER_SOCKET).exists() {
            return Err(KilnError::NoDaemonConnectInfo { runtime: DOCKER_RUNTIME.to_string() });
        }

        debug!(?host, "docker daemon connection info resolved");
        Ok(Self { host })
    }

    fn envs(&self) -> Vec<(String, String)> {
        self.host.iter().map(|h| ("DOCKER_HOST".to_string(), h.clone())).collect()
    }
}

#[async_trait]
impl ImageBuilder for DockerDaemonClient {
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

        let log = run_tool("docker", &args, &self.envs()).await.map_err(|e| {
            KilnError::BuildFailed { engine: DOCKER_RUNTIME.to_string(), reason: e.to_string() }
        })?;
        out.log_dump("engine.docker.build", &log, ovars! {"image" => &params.image_name});

        let save_args = vec![
            "save".to_string(),
            "-o".to_string(),
            params.image_archive_file.clone(),
            params.image_name.clone(),
        ];
        run_tool("docker", &save_args, &self.envs()).await.map_err(|e| {
            KilnError::BuildFailed { engine: DOCKER_RUNTIME.to_string(), reason: e.to_string() }
        })?;

        Ok(PathBuf::from(&params.image_archive_file))
    }
}

#[async_trait]
impl ImageLoader for DockerDaemonClient {
    async fn load_image(&self, archive: &Path, out: &Output) -> Result<()> {
        let args =
            vec!["load".to_string(), "-i".to_string(), archive.to_string_lossy().to_string()];
        let log = run_tool("docker", &args, &self.envs()).await.map_err(|e| {
            KilnError::LoadFailed { runtime: DOCKER_RUNTIME.to_string(), reason: e.to_string() }
        })?;
        out.log_dump(
            "runtime.docker.load",
            &log,
            ovars! {"image.archive.file" => archive.display()},
        );

        Ok(())
    }
}
