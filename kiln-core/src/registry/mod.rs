//! OCI registry client.
//!
//! Push and save operations against container registries, plus credential
//! resolution from explicit parameters or the Docker CLI credential store.
//! The wire protocol itself is delegated to `oci-distribution`.

pub mod archive;

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{self, ImageIndexEntry};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{KilnError, Result};
use crate::paths;

/// Resolved registry credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCredentials {
    Anonymous,
    Basic { username: String, password: String },
}

impl RegistryCredentials {
    fn to_auth(&self) -> RegistryAuth {
        match self {
            RegistryCredentials::Anonymous => RegistryAuth::Anonymous,
            RegistryCredentials::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }
}

/// Registry operations the orchestrator needs; implementation detail
/// (protocol, auth exchange) is opaque to callers.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Resolve credentials from explicit account/secret parameters or, when
    /// `use_stored_creds` is set, from the Docker CLI credential store.
    async fn configure_auth(
        &self,
        use_stored_creds: bool,
        account: &str,
        secret: &str,
    ) -> Result<RegistryCredentials>;

    /// Push a local docker-save archive under the given image name.
    async fn push_from_archive(
        &self,
        archive_path: &Path,
        image_name: &str,
        creds: &RegistryCredentials,
    ) -> Result<()>;

    /// Pull the referenced image and write it as a docker-save archive.
    async fn save_to_archive(
        &self,
        image_ref: &str,
        dest: &Path,
        creds: &RegistryCredentials,
    ) -> Result<()>;
}

#[derive(Default)]
pub struct RegistryClient;

impl RegistryClient {
    pub fn new() -> Self {
        Self
    }

    fn client(&self) -> Client {
        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(vec!["localhost".to_string()]),
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Client::new(config)
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn configure_auth(
        &self,
        use_stored_creds: bool,
        account: &str,
        secret: &str,
    ) -> Result<RegistryCredentials> {
        if !account.is_empty() {
            return Ok(RegistryCredentials::Basic {
                username: account.to_string(),
                password: secret.to_string(),
            });
        }

        if use_stored_creds {
            let config_path = paths::docker_config_path().ok_or_else(|| {
                KilnError::RegistryAuth { reason: "no Docker config location".to_string() }
            })?;
            return stored_credentials_from(&config_path);
        }

        Ok(RegistryCredentials::Anonymous)
    }

    async fn push_from_archive(
        &self,
        archive_path: &Path,
        image_name: &str,
        creds: &RegistryCredentials,
    ) -> Result<()> {
        let reference = parse_reference(image_name)?;
        let image = archive::read(archive_path)?;

        let layers: Vec<ImageLayer> = image
            .layers
            .into_iter()
            .map(|data| {
                ImageLayer::new(data, manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE.to_string(), None)
            })
            .collect();
        let config =
            Config::new(image.config, manifest::IMAGE_CONFIG_MEDIA_TYPE.to_string(), None);

        info!(image = %reference, layers = layers.len(), "pushing image archive");
        let response = self
            .client()
            .push(&reference, &layers, config, &creds.to_auth(), None)
            .await
            .map_err(|e| KilnError::RegistryPush {
                image: image_name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(manifest_url = %response.manifest_url, "image pushed");

        Ok(())
    }

    async fn save_to_archive(
        &self,
        image_ref: &str,
        dest: &Path,
        creds: &RegistryCredentials,
    ) -> Result<()> {
        let reference = parse_reference(image_ref)?;

        let image_data = self
            .client()
            .pull(
                &reference,
                &creds.to_auth(),
                vec![
                    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
                    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                    manifest::IMAGE_LAYER_MEDIA_TYPE,
                    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                ],
            )
            .await
            .map_err(|e| KilnError::RegistrySave {
                image: image_ref.to_string(),
                reason: e.to_string(),
            })?;

        info!(image = %reference, layers = image_data.layers.len(), "image pulled for save");

        let layers: Vec<Vec<u8>> = image_data.layers.into_iter().map(|l| l.data).collect();
        archive::write(dest, image_ref, &image_data.config.data, &layers)
    }
}

/// Read credentials from a Docker CLI config file: the Docker Hub entry
/// when present, the first `auth` entry otherwise.
fn stored_credentials_from(config_path: &Path) -> Result<RegistryCredentials> {
    #[derive(Deserialize)]
    struct DockerConfig {
        #[serde(default)]
        auths: std::collections::BTreeMap<String, DockerAuthEntry>,
    }

    #[derive(Deserialize)]
    struct DockerAuthEntry {
        #[serde(default)]
        auth: String,
    }

    let contents = std::fs::read_to_string(config_path).map_err(|e| KilnError::RegistryAuth {
        reason: format!("cannot read {}: {}", config_path.display(), e),
    })?;
    let config: DockerConfig =
        serde_json::from_str(&contents).map_err(|e| KilnError::RegistryAuth {
            reason: format!("cannot parse {}: {}", config_path.display(), e),
        })?;

    let entry = config
        .auths
        .iter()
        .find(|(registry, entry)| registry.contains("index.docker.io") && !entry.auth.is_empty())
        .or_else(|| config.auths.iter().find(|(_, entry)| !entry.auth.is_empty()));

    let (registry, entry) = entry.ok_or_else(|| KilnError::RegistryAuth {
        reason: "no stored credentials found".to_string(),
    })?;

    let decoded = BASE64.decode(&entry.auth).map_err(|e| KilnError::RegistryAuth {
        reason: format!("bad auth entry for {}: {}", registry, e),
    })?;
    let decoded = String::from_utf8(decoded).map_err(|e| KilnError::RegistryAuth {
        reason: format!("bad auth entry for {}: {}", registry, e),
    })?;

    let (username, password) = decoded.split_once(':').ok_or_else(|| KilnError::RegistryAuth {
        reason: format!("malformed auth entry for {}", registry),
    })?;

    debug!(registry, username, "using stored registry credentials");
    Ok(RegistryCredentials::Basic {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Parse an image reference, normalizing bare Docker Hub names and adding
/// `:latest` when no tag or digest is present.
fn parse_reference(image: &str) -> Result<Reference> {
    let normalized = if !image.contains('/') {
        format!("docker.io/library/{}", image)
    } else if image.split('/').next().is_some_and(|host| {
        !host.contains('.') && !host.contains(':') && host != "localhost"
    }) {
        format!("docker.io/{}", image)
    } else {
        image.to_string()
    };

    let normalized = if !normalized.rsplit('/').next().unwrap_or_default().contains(':')
        && !normalized.contains('@')
    {
        format!("{}:latest", normalized)
    } else {
        normalized
    };

    Reference::try_from(normalized.as_str()).map_err(|e| KilnError::InvalidReference {
        reference: image.to_string(),
        reason: e.to_string(),
    })
}

/// Pick the manifest entry matching the linux variant of the host
/// architecture for multi-arch references.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|platform| platform.os == "linux" && platform.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
