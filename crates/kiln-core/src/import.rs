//! Digest-verified base image import.
//!
//! A pull through the daemon hashes image content while it is already being
//! applied. Here the archive is downloaded to a temporary file and hashed
//! first; only a verified file is handed to the engine's import endpoint.

use crate::build::sorted_images;
use crate::CoreError;
use kiln_engine::ContainerEngine;
use kiln_schema::{ImageId, SecureBaseRef};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

const CHUNK_SIZE: usize = 8192;

pub struct SecureImporter {
    agent: ureq::Agent,
}

impl SecureImporter {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }

    /// Deterministic cache tag for a base reference:
    /// `<tag-prefix>-<sha256(url + digest)>`.
    pub fn cache_tag(base: &SecureBaseRef) -> String {
        let mut hasher = Sha256::new();
        hasher.update(base.url.as_bytes());
        hasher.update(base.digest.as_bytes());
        format!("{}-{}", base.tag_prefix, hex::encode(hasher.finalize()))
    }

    /// Return the image for `base`, importing it when no image carries the
    /// cache tag yet.
    pub fn import(
        &self,
        engine: &dyn ContainerEngine,
        base: &SecureBaseRef,
    ) -> Result<ImageId, CoreError> {
        let tag = Self::cache_tag(base);
        if let Some(hit) = sorted_images(engine)?
            .into_iter()
            .find(|i| i.has_repo_tag(&base.repository, &tag))
        {
            debug!("base image {}:{tag} already imported", base.repository);
            return Ok(hit.id);
        }

        info!("downloading base image {}", base.url);
        let downloaded = self.download_verified(base)?;
        let archive = if base.url.ends_with(".xz") {
            decompress_xz(&downloaded)?
        } else {
            downloaded
        };

        let id = engine.import_image(archive.path(), &base.repository, &tag)?;
        info!("imported {}:{tag} as {id}", base.repository);
        Ok(id)
    }

    /// Download `base.url` into a temporary file, hashing as it streams.
    /// The file is dropped unless its SHA-256 equals `base.digest`.
    fn download_verified(&self, base: &SecureBaseRef) -> Result<NamedTempFile, CoreError> {
        let mut reader = self.open(&base.url)?;
        let mut file = NamedTempFile::new()?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).map_err(|e| CoreError::Download {
                url: base.url.clone(),
                reason: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
        }
        file.flush()?;

        let actual = hex::encode(hasher.finalize());
        if actual != base.digest {
            return Err(CoreError::Integrity {
                url: base.url.clone(),
                expected: base.digest.clone(),
                actual,
            });
        }
        Ok(file)
    }

    fn open(&self, url: &str) -> Result<Box<dyn Read>, CoreError> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Box::new(File::open(path)?));
        }
        let resp = self
            .agent
            .get(url)
            .call()
            .map_err(|e| CoreError::Download {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(resp.into_body().into_reader()))
    }
}

/// The engine's import endpoint does not accept xz, so decompress locally.
fn decompress_xz(compressed: &NamedTempFile) -> Result<NamedTempFile, CoreError> {
    let out = NamedTempFile::new()?;
    let status = Command::new("xz")
        .arg("-dc")
        .stdin(Stdio::from(compressed.reopen()?))
        .stdout(Stdio::from(out.reopen()?))
        .status()
        .map_err(|e| CoreError::Command {
            command: "xz -dc".to_owned(),
            detail: e.to_string(),
        })?;
    if !status.success() {
        return Err(CoreError::Command {
            command: "xz -dc".to_owned(),
            detail: status.to_string(),
        });
    }
    Ok(out)
}
