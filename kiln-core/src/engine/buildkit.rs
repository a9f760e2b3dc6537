//! BuildKit remote build service client.
//!
//! Talks to a buildkitd endpoint through `buildctl`. The endpoint is the
//! only connection requirement; the archive comes back as a docker-type
//! output so the rest of the pipeline (runtime load, registry push) is
//! engine-agnostic.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::context::output::Output;
use crate::engine::{engine_props, run_tool, BuildParams, ImageBuilder, BUILDKIT_ENGINE};
use crate::error::{KilnError, Result};
use crate::ovars;

pub struct BuildkitClient {
    endpoint: String,
}

impl BuildkitClient {
    /// Resolve the endpoint from the params, falling back to the catalog
    /// default when one exists.
    pub fn from_params(params: &BuildParams) -> Result<Self> {
        let endpoint = if !params.engine_endpoint.is_empty() {
            params.engine_endpoint.clone()
        } else if let Some(default) =
            engine_props(BUILDKIT_ENGINE).and_then(|p| p.default_endpoint)
        {
            default.to_string()
        } else {
            return Err(KilnError::MissingEngineRequirement {
                engine: BUILDKIT_ENGINE.to_string(),
                requirement: "an endpoint (--engine-endpoint)".to_string(),
            });
        };

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl ImageBuilder for BuildkitClient {
    async fn build(&self, params: &BuildParams, out: &Output) -> Result<PathBuf> {
        let dockerfile = Path::new(&params.dockerfile);
        let dockerfile_dir = dockerfile
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let dockerfile_name =
            dockerfile.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| {
                params.dockerfile.clone()
            });

        let mut args = vec![
            "--addr".to_string(),
            self.endpoint.clone(),
            "build".to_string(),
            "--frontend".to_string(),
            "dockerfile.v0".to_string(),
            "--local".to_string(),
            format!("context={}", params.context_dir),
            "--local".to_string(),
            format!("dockerfile={}", dockerfile_dir.display()),
            "--opt".to_string(),
            format!("filename={}", dockerfile_name),
            "--opt".to_string(),
            format!("platform=linux/{}", params.architecture),
        ];
        for (key, value) in &params.build_args {
            args.push("--opt".to_string());
            args.push(format!("build-arg:{}={}", key, value));
        }
        for (key, value) in &params.labels {
            args.push("--opt".to_string());
            args.push(format!("label:{}={}", key, value));
        }
        args.push("--output".to_string());
        args.push(format!(
            "type=docker,name={},dest={}",
            params.image_name, params.image_archive_file
        ));

        let log = run_tool("buildctl", &args, &[]).await.map_err(|e| {
            KilnError::BuildFailed { engine: BUILDKIT_ENGINE.to_string(), reason: e.to_string() }
        })?;
        out.log_dump(
            "engine.buildkit.build",
            &log,
            ovars! {"image" => &params.image_name, "endpoint" => &self.endpoint},
        );

        Ok(PathBuf::from(&params.image_archive_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_required() {
        let params = BuildParams { engine: BUILDKIT_ENGINE.to_string(), ..Default::default() };
        assert!(matches!(
            BuildkitClient::from_params(&params),
            Err(KilnError::MissingEngineRequirement { .. })
        ));

        let params = BuildParams {
            engine: BUILDKIT_ENGINE.to_string(),
            engine_endpoint: "tcp://127.0.0.1:1234".to_string(),
            ..Default::default()
        };
        assert!(BuildkitClient::from_params(&params).is_ok());
    }
}
