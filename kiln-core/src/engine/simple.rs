//! Built-in minimal build engine.
//!
//! Composes an image archive in-process, without a daemon: an optional base
//! (a local docker-save archive, a registry reference, or the certs-only
//! distroless base) plus an optional single-file entrypoint layer. Images
//! that need `RUN` instructions are out of reach for this engine by design;
//! it exists so small single-binary images can be produced with nothing but
//! kiln itself installed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::context::output::Output;
use crate::engine::{BuildParams, ImageBuilder, SIMPLE_ENGINE};
use crate::error::{KilnError, Result};
use crate::ovars;
use crate::registry::{archive, RegistryApi, RegistryCredentials};

/// Base image used for `--base-with-certs`: CA certificates and timezone
/// info, nothing else.
pub const CERTS_BASE_IMAGE: &str = "gcr.io/distroless/static-debian12:latest";

pub struct SimpleEngine {
    registry: Arc<dyn RegistryApi>,
}

impl SimpleEngine {
    pub fn new(registry: Arc<dyn RegistryApi>) -> Self {
        Self { registry }
    }

    /// Resolve the base image selection to a local docker-save archive, or
    /// `None` for a scratch base.
    async fn resolve_base(&self, params: &BuildParams) -> Result<Option<PathBuf>> {
        if !params.base_tar.is_empty() {
            return Ok(Some(PathBuf::from(&params.base_tar)));
        }

        let reference = if params.base_with_certs {
            CERTS_BASE_IMAGE.to_string()
        } else if !params.base_image.is_empty() {
            params.base_image.clone()
        } else {
            return Ok(None);
        };

        let dest = std::env::temp_dir().join(format!("kiln-base-{}.tar", std::process::id()));
        debug!(reference, dest = %dest.display(), "fetching base image archive");
        self.registry.save_to_archive(&reference, &dest, &RegistryCredentials::Anonymous).await?;
        Ok(Some(dest))
    }
}

#[async_trait]
impl ImageBuilder for SimpleEngine {
    async fn build(&self, params: &BuildParams, out: &Output) -> Result<PathBuf> {
        if params.exe_path.is_empty()
            && params.base_tar.is_empty()
            && params.base_image.is_empty()
            && !params.base_with_certs
        {
            return Err(KilnError::BuildFailed {
                engine: SIMPLE_ENGINE.to_string(),
                reason: "nothing to compose: provide --exe-path and/or a base image".to_string(),
            });
        }

        let mut layers: Vec<Vec<u8>> = Vec::new();

        if let Some(base_archive) = self.resolve_base(params).await? {
            let base = archive::read(&base_archive)?;
            out.info(
                "engine.simple.base",
                ovars! {"archive" => base_archive.display(), "layers" => base.layers.len()},
            );
            layers.extend(base.layers);
        }

        let mut entrypoint = None;
        if !params.exe_path.is_empty() {
            let (layer, exe_name) = compose_exe_layer(Path::new(&params.exe_path))?;
            layers.push(layer);
            entrypoint = Some(vec![format!("/{}", exe_name)]);
        }

        let config = image_config(&params.architecture, &layers, entrypoint, &params.labels)?;
        let archive_path = PathBuf::from(&params.image_archive_file);
        archive::write(&archive_path, &params.image_name, &config, &layers)?;

        out.info(
            "engine.simple.image",
            ovars! {
                "image" => &params.image_name,
                "image.archive.file" => archive_path.display(),
                "layers" => layers.len(),
            },
        );

        Ok(archive_path)
    }
}

/// Build a single-file layer tar holding the executable at the image root.
fn compose_exe_layer(exe_path: &Path) -> Result<(Vec<u8>, String)> {
    let data = std::fs::read(exe_path)
        .map_err(|e| KilnError::FileRead { path: exe_path.to_path_buf(), source: e })?;
    let exe_name = exe_path.file_name().map(|n| n.to_string_lossy().to_string()).ok_or_else(
        || KilnError::BuildFailed {
            engine: SIMPLE_ENGINE.to_string(),
            reason: format!("--exe-path has no file name: {}", exe_path.display()),
        },
    )?;

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, &exe_name, data.as_slice()).map_err(|e| {
        KilnError::BuildFailed { engine: SIMPLE_ENGINE.to_string(), reason: e.to_string() }
    })?;
    let layer = builder.into_inner().map_err(|e| KilnError::BuildFailed {
        engine: SIMPLE_ENGINE.to_string(),
        reason: e.to_string(),
    })?;

    Ok((layer, exe_name))
}

/// Image config blob with diff_ids derived from the uncompressed layers.
fn image_config(
    architecture: &str,
    layers: &[Vec<u8>],
    entrypoint: Option<Vec<String>>,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    let diff_ids: Vec<String> =
        layers.iter().map(|layer| format!("sha256:{:x}", Sha256::digest(layer))).collect();

    let config = serde_json::json!({
        "architecture": architecture,
        "os": "linux",
        "config": {
            "Entrypoint": entrypoint,
            "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
            "Labels": labels,
        },
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids,
        },
    });

    Ok(serde_json::to_vec(&config)?)
}
