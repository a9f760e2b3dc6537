//! Build engines and runtime-load targets.
//!
//! An engine is a pluggable backend that produces a container image archive
//! from build inputs; a runtime-load target is a local container runtime the
//! finished archive gets imported into. The static catalog below maps engine
//! identifiers to capability metadata (auth/namespace/endpoint requirements
//! and the native environment variables for credentials); it is read-only
//! after process start. Concrete clients live in the sibling modules and are
//! reached only through the object-safe traits at the bottom, so the
//! orchestrator never depends on a specific backend.

pub mod buildkit;
pub mod depot;
pub mod docker;
pub mod podman;
pub mod simple;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::context::output::Output;
use crate::error::{KilnError, Result};
use crate::registry::RegistryApi;

// Engine identifiers
pub const DOCKER_ENGINE: &str = "docker";
pub const BUILDKIT_ENGINE: &str = "buildkit";
pub const DEPOT_ENGINE: &str = "depot";
pub const PODMAN_ENGINE: &str = "podman";
pub const SIMPLE_ENGINE: &str = "simple";

// Runtime-load targets
pub const NONE_RUNTIME: &str = "none";
pub const DOCKER_RUNTIME: &str = "docker";
pub const PODMAN_RUNTIME: &str = "podman";

// Build architectures
pub const AMD64_ARCH: &str = "amd64";
pub const ARM64_ARCH: &str = "arm64";

pub const DEFAULT_IMAGE_NAME: &str = "kiln-new-container-image:latest";
pub const DEFAULT_IMAGE_ARCHIVE_FILE: &str = "kiln-new-container-image.tar";
pub const DEFAULT_DOCKERFILE_PATH: &str = "Dockerfile";
pub const DEFAULT_CONTEXT_DIR: &str = ".";
pub const DEFAULT_ENGINE: &str = DOCKER_ENGINE;
pub const DEFAULT_RUNTIME_LOAD: &str = NONE_RUNTIME;

/// Capability metadata for a build engine.
#[derive(Debug, Clone)]
pub struct EngineProps {
    pub info: &'static str,
    pub token_required: bool,
    pub namespace_required: bool,
    pub endpoint_required: bool,
    pub native_token_env_var: Option<&'static str>,
    pub native_namespace_env_var: Option<&'static str>,
    /// What the engine calls its namespace (e.g. "project").
    pub namespace_name: Option<&'static str>,
    pub default_endpoint: Option<&'static str>,
}

impl EngineProps {
    const fn basic(info: &'static str) -> Self {
        Self {
            info,
            token_required: false,
            namespace_required: false,
            endpoint_required: false,
            native_token_env_var: None,
            native_namespace_env_var: None,
            namespace_name: None,
            default_endpoint: None,
        }
    }
}

static BUILD_ENGINES: Lazy<HashMap<&'static str, EngineProps>> = Lazy::new(|| {
    HashMap::from([
        (DOCKER_ENGINE, EngineProps::basic("Native Docker daemon build engine")),
        (
            BUILDKIT_ENGINE,
            EngineProps {
                endpoint_required: true,
                ..EngineProps::basic("BuildKit container build engine")
            },
        ),
        (
            DEPOT_ENGINE,
            EngineProps {
                token_required: true,
                namespace_required: true,
                native_token_env_var: Some("DEPOT_TOKEN"),
                native_namespace_env_var: Some("DEPOT_PROJECT_ID"),
                namespace_name: Some("project"),
                ..EngineProps::basic("Depot.dev cloud-based container build engine")
            },
        ),
        (PODMAN_ENGINE, EngineProps::basic("Native Podman/Buildah build engine")),
        (
            SIMPLE_ENGINE,
            EngineProps::basic(
                "Built-in build engine for simple images that do not use 'RUN' instructions",
            ),
        ),
    ])
});

/// Look up an engine in the static catalog. `None` means the selection is
/// unsupported and gets its own terminal exit code.
pub fn engine_props(engine: &str) -> Option<&'static EngineProps> {
    BUILD_ENGINES.get(engine)
}

/// All catalog engine identifiers, for help text and validation messages.
pub fn engine_names() -> Vec<&'static str> {
    let mut names: Vec<_> = BUILD_ENGINES.keys().copied().collect();
    names.sort_unstable();
    names
}

pub fn is_runtime_value(name: &str) -> bool {
    matches!(name, NONE_RUNTIME | DOCKER_RUNTIME | PODMAN_RUNTIME)
}

pub fn is_arch_value(name: &str) -> bool {
    matches!(name, AMD64_ARCH | ARM64_ARCH)
}

/// Build architecture matching the host, falling back to amd64.
pub fn default_build_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => ARM64_ARCH,
        _ => AMD64_ARCH,
    }
}

/// Generic per-invocation parameters shared by all commands.
#[derive(Debug, Clone, Default)]
pub struct GenericParams {
    pub check_version: bool,
    pub debug: bool,
    pub in_container: bool,
    /// Running inside the official kiln distribution image.
    pub is_kiln_image: bool,
    /// Report file location; empty or "off" disables reporting.
    pub report_location: String,
    /// Explicit Podman connection URI override.
    pub runtime_connection: Option<String>,
}

/// Immutable parameters of one build invocation.
#[derive(Debug, Clone, Serialize)]
pub struct BuildParams {
    /// Selected engine identifier, validated against the catalog at dispatch.
    pub engine: String,
    pub engine_endpoint: String,
    #[serde(skip_serializing)]
    pub engine_token: String,
    pub engine_namespace: String,
    pub image_name: String,
    pub image_archive_file: String,
    pub dockerfile: String,
    pub context_dir: String,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub architecture: String,
    pub base_image: String,
    pub base_tar: String,
    pub base_with_certs: bool,
    pub exe_path: String,
    pub load_runtimes: Vec<String>,
    pub registry_push: bool,
    pub use_docker_creds: bool,
    pub creds_account: String,
    #[serde(skip_serializing)]
    pub creds_secret: String,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            engine: DEFAULT_ENGINE.to_string(),
            engine_endpoint: String::new(),
            engine_token: String::new(),
            engine_namespace: String::new(),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            image_archive_file: DEFAULT_IMAGE_ARCHIVE_FILE.to_string(),
            dockerfile: DEFAULT_DOCKERFILE_PATH.to_string(),
            context_dir: DEFAULT_CONTEXT_DIR.to_string(),
            build_args: BTreeMap::new(),
            labels: BTreeMap::new(),
            architecture: default_build_arch().to_string(),
            base_image: String::new(),
            base_tar: String::new(),
            base_with_certs: false,
            exe_path: String::new(),
            load_runtimes: Vec::new(),
            registry_push: false,
            use_docker_creds: false,
            creds_account: String::new(),
            creds_secret: String::new(),
        }
    }
}

/// Produces a container image archive from build inputs.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image and return the path of the produced archive.
    async fn build(&self, params: &BuildParams, out: &Output) -> Result<PathBuf>;
}

/// Imports an image archive into a local container runtime.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load_image(&self, archive: &Path, out: &Output) -> Result<()>;
}

/// A native daemon exposes both capabilities over one connection.
pub trait DaemonApi: ImageBuilder + ImageLoader {}

impl<T: ImageBuilder + ImageLoader> DaemonApi for T {}

/// Lazy client constructors. Daemon constructors return the distinguished
/// [`KilnError::NoDaemonConnectInfo`] variant when connection info is
/// missing; the orchestrator memoizes whatever they hand out.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn docker_daemon(&self) -> Result<Arc<dyn DaemonApi>>;

    async fn podman_daemon(&self) -> Result<Arc<dyn DaemonApi>>;

    /// Remote build service client for `buildkit` or `depot`.
    fn remote_builder(&self, engine: &str, params: &BuildParams) -> Result<Arc<dyn ImageBuilder>>;

    /// The built-in minimal composer.
    fn simple_builder(&self) -> Arc<dyn ImageBuilder>;

    fn registry(&self) -> Arc<dyn RegistryApi>;
}

/// Run an external tool to completion, returning its combined output.
/// A non-zero exit status becomes a [`KilnError::Subprocess`] carrying the
/// tool's stderr.
pub(crate) async fn run_tool(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
) -> Result<String> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let output = cmd.output().await.map_err(|e| KilnError::Subprocess {
        program: program.to_string(),
        reason: e.to_string(),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        return Err(KilnError::Subprocess {
            program: program.to_string(),
            reason: if stderr.is_empty() { format!("exit status {}", output.status) } else { stderr },
        });
    }

    if stderr.is_empty() {
        Ok(stdout)
    } else {
        Ok(format!("{}{}", stdout, stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_requirements() {
        assert!(engine_props(DOCKER_ENGINE).is_some());
        assert!(engine_props("bazel").is_none());

        let buildkit = engine_props(BUILDKIT_ENGINE).unwrap();
        assert!(buildkit.endpoint_required);
        assert!(!buildkit.token_required);

        let depot = engine_props(DEPOT_ENGINE).unwrap();
        assert!(depot.token_required);
        assert!(depot.namespace_required);
        assert_eq!(depot.native_token_env_var, Some("DEPOT_TOKEN"));
        assert_eq!(depot.namespace_name, Some("project"));
    }

    #[test]
    fn test_runtime_and_arch_validation() {
        assert!(is_runtime_value(NONE_RUNTIME));
        assert!(is_runtime_value(DOCKER_RUNTIME));
        assert!(is_runtime_value(PODMAN_RUNTIME));
        assert!(!is_runtime_value("containerd"));

        assert!(is_arch_value(AMD64_ARCH));
        assert!(is_arch_value(ARM64_ARCH));
        assert!(!is_arch_value("riscv64"));
    }

    #[test]
    fn test_params_serialization_redacts_secrets() {
        let params = BuildParams {
            engine_token: "sekrit".to_string(),
            creds_secret: "hunter2".to_string(),
            ..Default::default()
        };

        let rendered = serde_json::to_string(&params).unwrap();
        assert!(!rendered.contains("sekrit"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains(DEFAULT_IMAGE_NAME));
    }
}
