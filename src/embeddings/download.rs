// download.rs - Model file download with SHA256 verification.
//
// Downloads model weights on first use, caches locally at ~/.ingredient-matcher/models/.
// Files are verified against known SHA256 hashes to ensure integrity.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

use crate::config;

const MODEL_FILES: [(&str, &str); 3] = [
    ("model.safetensors", config::embedding::MODEL_SAFETENSORS_SHA256),
    ("tokenizer.json", config::embedding::TOKENIZER_JSON_SHA256),
    ("config.json", config::embedding::CONFIG_JSON_SHA256),
];

/// Returns the default local model directory path (~/.ingredient-matcher/models/all-MiniLM-L6-v2/).
pub fn default_model_dir() -> anyhow::Result<PathBuf> {
    let home = crate::logging::home_dir()
        .context("cannot determine home directory (neither HOME nor USERPROFILE is set)")?;
    Ok(home.join(config::embedding::MODEL_DIR_REL))
}

/// Check if all required model files exist in `dir`.
pub fn model_files_exist(dir: &Path) -> bool {
    MODEL_FILES.iter().all(|(name, _)| dir.join(name).exists())
}

/// Resolve the directory holding the model files.
///
/// An explicit directory must already contain every file (nothing is downloaded into it).
/// Otherwise the default cache directory is used and filled from `base_url` when needed.
pub fn ensure_model_files(explicit_dir: Option<&Path>, base_url: &str) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit_dir {
        if !model_files_exist(dir) {
            bail!(
                "model directory {} is missing one of: {}",
                dir.display(),
                MODEL_FILES.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
            );
        }
        log::info!("Using model files from {}", dir.display());
        return Ok(dir.to_path_buf());
    }

    let dir = default_model_dir()?;

    if model_files_exist(&dir) {
        log::info!("Model files already cached at {}", dir.display());
        return Ok(dir);
    }

    log::info!("Downloading embedding model to {}", dir.display());
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create model dir {}", dir.display()))?;

    let base = base_url.trim_end_matches('/');
    for (name, sha256) in MODEL_FILES {
        let dest = dir.join(name);
        if dest.exists() {
            continue;
        }
        download_and_verify(&format!("{base}/{name}"), &dest, sha256)?;
    }

    log::info!("Model download complete");
    Ok(dir)
}

/// Download a file from URL and verify its SHA256 hash.
fn download_and_verify(url: &str, dest: &Path, expected_sha256: &str) -> anyhow::Result<()> {
    let filename = dest.file_name().unwrap_or_default().to_string_lossy();
    log::info!("Downloading {} from {}", filename, url);

    let resp = ureq::get(url)
        .timeout(std::time::Duration::from_secs(config::embedding::DOWNLOAD_TIMEOUT_SECS))
        .call()
        .with_context(|| format!("failed to download {url}"))?;

    let status = resp.status();
    if status != 200 {
        bail!("HTTP {status} downloading {url}");
    }

    // Model is ~87 MB, fits in RAM
    let mut body = Vec::new();
    resp.into_reader()
        .read_to_end(&mut body)
        .with_context(|| format!("failed to read response body for {url}"))?;

    let actual_hash = sha256_hex(&body);
    if actual_hash != expected_sha256 {
        bail!(
            "SHA256 mismatch for {}: expected {}, got {}",
            filename,
            expected_sha256,
            actual_hash
        );
    }

    log::info!("SHA256 verified for {} ({})", filename, &actual_hash[..12]);

    // Write atomically: write to .tmp, then rename
    let tmp_path = dest.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(&body)?;
    file.flush()?;
    drop(file);

    fs::rename(&tmp_path, dest)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), dest.display()))?;

    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_explicit_dir_without_files_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_model_files(Some(dir.path()), "http://127.0.0.1:9").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_explicit_dir_with_files_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        for (name, _) in MODEL_FILES {
            fs::write(dir.path().join(name), b"stub").unwrap();
        }
        let resolved = ensure_model_files(Some(dir.path()), "http://127.0.0.1:9").unwrap();
        assert_eq!(resolved, dir.path());
    }
}
