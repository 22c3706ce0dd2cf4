use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use image::{GrayImage, RgbImage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const RUNS_DIR: &str = "runs";
pub const OUTPUTS_DIR: &str = "outputs";
pub const MASKS_DIR: &str = "masks";

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("failed to create run-log parent directory '{path}': {message}")]
    CreateParent { path: String, message: String },
    #[error("failed to serialize run log JSON: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write run log '{path}': {message}")]
    WriteFile { path: String, message: String },
    #[error("failed to write image '{path}': {message}")]
    WriteImage { path: String, message: String },
}

pub fn write_pretty_json_with_newline<T>(path: &Path, value: &T) -> Result<(), RunLogError>
where
    T: Serialize,
{
    ensure_parent(path)?;
    let mut bytes = serde_json::to_vec_pretty(value).map_err(RunLogError::Serialize)?;
    bytes.push(b'\n');
    fs::write(path, bytes).map_err(|error| RunLogError::WriteFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    Ok(())
}

pub fn write_png(path: &Path, image: &RgbImage) -> Result<(), RunLogError> {
    ensure_parent(path)?;
    image.save(path).map_err(|error| RunLogError::WriteImage {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

pub fn write_mask_png(path: &Path, mask: &GrayImage) -> Result<(), RunLogError> {
    ensure_parent(path)?;
    mask.save(path).map_err(|error| RunLogError::WriteImage {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

fn ensure_parent(path: &Path) -> Result<(), RunLogError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| RunLogError::CreateParent {
            path: parent.display().to_string(),
            message: error.to_string(),
        })?;
    }
    Ok(())
}

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Fingerprint of decoded pixels plus dimensions, independent of the
/// container format the source arrived in.
pub fn image_fingerprint(image: &RgbImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(image.as_raw());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub fn sanitize_id(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_sep = false;
    for ch in value.chars().flat_map(char::to_lowercase) {
        let keep = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_';
        if keep {
            out.push(ch);
            last_was_sep = false;
            continue;
        }
        if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.starts_with('_') {
        out.remove(0);
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

pub fn run_report_path(output_root: &Path, run_id: &str) -> PathBuf {
    output_root.join(RUNS_DIR).join(format!("{run_id}.json"))
}

/// Renders live under their run so a re-run of the same image id never
/// overwrites what an earlier report points at.
pub fn artifact_path(
    output_root: &Path,
    run_id: &str,
    image_id: &str,
    attempt_number: u32,
) -> PathBuf {
    output_root
        .join(OUTPUTS_DIR)
        .join(sanitize_id(run_id))
        .join(format!("{}_attempt{attempt_number}.png", sanitize_id(image_id)))
}

pub fn mask_path(output_root: &Path, run_id: &str, image_id: &str) -> PathBuf {
    output_root
        .join(MASKS_DIR)
        .join(sanitize_id(run_id))
        .join(format!("{}_mask.png", sanitize_id(image_id)))
}
