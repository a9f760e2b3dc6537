//! Depot.dev remote build service client.
//!
//! Requires an API token and a project namespace; both fall back to the
//! engine's native environment variables (`DEPOT_TOKEN`,
//! `DEPOT_PROJECT_ID`) from the catalog when not passed explicitly.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::context::output::Output;
use crate::engine::{engine_props, run_tool, BuildParams, ImageBuilder, DEPOT_ENGINE};
use crate::error::{KilnError, Result};
use crate::ovars;

pub struct DepotClient {
    token: String,
    project: String,
}

impl DepotClient {
    pub fn from_params(params: &BuildParams) -> Result<Self> {
        let props = engine_props(DEPOT_ENGINE).expect("depot is in the engine catalog");

        let token = resolve(&params.engine_token, props.native_token_env_var).ok_or_else(|| {
            KilnError::MissingEngineRequirement {
                engine: DEPOT_ENGINE.to_string(),
                requirement: "an API token (--engine-token or DEPOT_TOKEN)".to_string(),
            }
        })?;

        let project =
            resolve(&params.engine_namespace, props.native_namespace_env_var).ok_or_else(|| {
                KilnError::MissingEngineRequirement {
                    engine: DEPOT_ENGINE.to_string(),
                    requirement: "a project (--engine-namespace or DEPOT_PROJECT_ID)".to_string(),
                }
            })?;

        Ok(Self { token, project })
    }
}

fn resolve(explicit: &str, env_var: Option<&str>) -> Option<String> {
    if !explicit.is_empty() {
        return Some(explicit.to_string());
    }
    env_var.and_then(|name| std::env::var(name).ok()).filter(|v| !v.is_empty())
}

#[async_trait]
impl ImageBuilder for DepotClient {
    async fn build(&self, params: &BuildParams, out: &Output) -> Result<PathBuf> {
        let mut args = vec![
            "build".to_string(),
            "--project".to_string(),
            self.project.clone(),
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
        args.push("--output".to_string());
        args.push(format!("type=docker,dest={}", params.image_archive_file));
        args.push(params.context_dir.clone());

        let envs = [("DEPOT_TOKEN".to_string(), self.token.clone())];
        let log = run_tool("depot", &args, &envs).await.map_err(|e| KilnError::BuildFailed {
            engine: DEPOT_ENGINE.to_string(),
            reason: e.to_string(),
        })?;
        out.log_dump(
            "engine.depot.build",
            &log,
            ovars! {"image" => &params.image_name, "project" => &self.project},
        );

        Ok(PathBuf::from(&params.image_archive_file))
    }
}
