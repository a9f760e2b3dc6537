//! Default client wiring for production runs.

use std::sync::Arc;

use async_trait::async_trait;

use kiln_core::engine::buildkit::BuildkitClient;
use kiln_core::engine::depot::DepotClient;
use kiln_core::engine::docker::DockerDaemonClient;
use kiln_core::engine::podman::PodmanDaemonClient;
use kiln_core::engine::simple::SimpleEngine;
use kiln_core::engine::{
    BuildParams, ClientProvider, DaemonApi, ImageBuilder, BUILDKIT_ENGINE, DEPOT_ENGINE,
};
use kiln_core::error::Result;
use kiln_core::registry::{RegistryApi, RegistryClient};
use kiln_core::KilnError;

pub struct DefaultClientProvider {
    runtime_connection: Option<String>,
}

impl DefaultClientProvider {
    pub fn new(runtime_connection: Option<String>) -> Self {
        Self { runtime_connection }
    }
}

#[async_trait]
impl ClientProvider for DefaultClientProvider {
    async fn docker_daemon(&self) -> Result<Arc<dyn DaemonApi>> {
        Ok(Arc::new(DockerDaemonClient::connect()?))
    }

    async fn podman_daemon(&self) -> Result<Arc<dyn DaemonApi>> {
        Ok(Arc::new(PodmanDaemonClient::connect(self.runtime_connection.as_deref())?))
    }

    fn remote_builder(&self, engine: &str, params: &BuildParams) -> Result<Arc<dyn ImageBuilder>> {
        match engine {
            BUILDKIT_ENGINE => Ok(Arc::new(BuildkitClient::from_params(params)?)),
            DEPOT_ENGINE => Ok(Arc::new(DepotClient::from_params(params)?)),
            other => Err(KilnError::UnsupportedEngine { engine: other.to_string() }),
        }
    }

    fn simple_builder(&self) -> Arc<dyn ImageBuilder> {
        Arc::new(SimpleEngine::new(self.registry()))
    }

    fn registry(&self) -> Arc<dyn RegistryApi> {
        Arc::new(RegistryClient::new())
    }
}
