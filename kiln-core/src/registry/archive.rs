//! docker-save style image archives.
//!
//! The interchange format between engines, runtime loads, and registry
//! transfers: a tar holding `manifest.json`, the image config blob, and one
//! `<digest>/layer.tar` entry per layer. Layers are stored uncompressed;
//! gzipped layers are tolerated on read.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KilnError, Result};

/// One entry of a docker-save `manifest.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// An image archive loaded into memory: config blob plus uncompressed
/// layer tars in manifest order.
pub struct ImageArchive {
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
    pub repo_tags: Vec<String>,
}

/// Read a docker-save archive from disk.
pub fn read(archive_path: &Path) -> Result<ImageArchive> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| KilnError::FileRead { path: archive_path.to_path_buf(), source: e })?;
    let mut archive = tar::Archive::new(file);

    let invalid = |reason: String| KilnError::InvalidArchive {
        path: archive_path.to_path_buf(),
        reason,
    };

    let mut manifest: Option<Vec<ManifestEntry>> = None;
    let mut blobs: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for entry in archive.entries().map_err(|e| invalid(e.to_string()))? {
        let mut entry = entry.map_err(|e| invalid(e.to_string()))?;
        let name = entry.path().map(|p| p.to_string_lossy().to_string()).unwrap_or_default();

        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(|e| invalid(e.to_string()))?;

        if name == "manifest.json" {
            manifest = Some(serde_json::from_slice(&data)?);
        } else {
            blobs.insert(name, data);
        }
    }

    let manifest = manifest.ok_or_else(|| invalid("missing manifest.json".to_string()))?;
    let entry = manifest.into_iter().next().ok_or_else(|| invalid("empty manifest.json".to_string()))?;

    let config = blobs
        .remove(&entry.config)
        .ok_or_else(|| invalid(format!("missing config blob {}", entry.config)))?;

    let mut layers = Vec::with_capacity(entry.layers.len());
    for layer_name in &entry.layers {
        let data = blobs
            .remove(layer_name)
            .ok_or_else(|| invalid(format!("missing layer {}", layer_name)))?;
        layers.push(maybe_gunzip(data, layer_name, archive_path)?);
    }

    Ok(ImageArchive { config, layers, repo_tags: entry.repo_tags })
}

/// Write a docker-save archive to disk. Layer entries are named by their
/// content digest; `manifest.json` goes last.
pub fn write(dest: &Path, image_name: &str, config: &[u8], layers: &[Vec<u8>]) -> Result<()> {
    let file = std::fs::File::create(dest)
        .map_err(|e| KilnError::FileWrite { path: dest.to_path_buf(), source: e })?;
    let mut builder = tar::Builder::new(file);

    let mut layer_names = Vec::with_capacity(layers.len());
    for layer in layers {
        let name = format!("{:x}/layer.tar", Sha256::digest(layer));
        append_blob(&mut builder, dest, &name, layer)?;
        layer_names.push(name);
    }

    let config_name = format!("{:x}.json", Sha256::digest(config));
    append_blob(&mut builder, dest, &config_name, config)?;

    let manifest = vec![ManifestEntry {
        config: config_name,
        repo_tags: vec![image_name.to_string()],
        layers: layer_names,
    }];
    let manifest_data = serde_json::to_vec(&manifest)?;
    append_blob(&mut builder, dest, "manifest.json", &manifest_data)?;

    builder.finish().map_err(|e| KilnError::FileWrite { path: dest.to_path_buf(), source: e })
}

fn maybe_gunzip(data: Vec<u8>, name: &str, archive_path: &Path) -> Result<Vec<u8>> {
    if !name.ends_with(".gz") && !data.starts_with(&[0x1f, 0x8b]) {
        return Ok(data);
    }

    let mut decoder = flate2::read::GzDecoder::new(data.as_slice());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).map_err(|e| KilnError::InvalidArchive {
        path: archive_path.to_path_buf(),
        reason: format!("bad gzip layer {}: {}", name, e),
    })?;
    Ok(decompressed)
}

fn append_blob<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dest: &Path,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| KilnError::FileWrite { path: dest.to_path_buf(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image.tar");

        let config = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let layer = b"layer-bytes".to_vec();
        write(&path, "demo:latest", &config, &[layer.clone()]).unwrap();

        let loaded = read(&path).unwrap();
        assert_eq!(loaded.config, config);
        assert_eq!(loaded.layers, vec![layer]);
        assert_eq!(loaded.repo_tags, vec!["demo:latest".to_string()]);
    }

    #[test]
    fn test_gzipped_layer_is_decompressed() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"layer-bytes").unwrap();
        let compressed = encoder.finish().unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image.tar");
        write(&path, "demo:latest", b"{}", &[compressed]).unwrap();

        let loaded = read(&path).unwrap();
        assert_eq!(loaded.layers, vec![b"layer-bytes".to_vec()]);
    }

    #[test]
    fn test_missing_manifest_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus.tar");
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.finish().unwrap();

        assert!(matches!(read(&path), Err(KilnError::InvalidArchive { .. })));
    }
}
