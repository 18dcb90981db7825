//! Input validation shared by the camera registry, the job runner and the HTTP layer.
//!
//! Everything that arrives from outside the process (camera ids, source URLs,
//! media paths named in job payloads, numeric tunables) goes through these
//! helpers before a worker or task is created, so malformed requests are
//! rejected synchronously with a readable reason.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for camera ids, person ids and job ids
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length for source URLs
pub const MAX_URI_LENGTH: usize = 4096;

/// Maximum length for file paths
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum length for display names
pub const MAX_NAME_LENGTH: usize = 512;

// ============================================================================
// Safe Time Operations
// ============================================================================

/// Current Unix time in milliseconds, logging and returning 0 if the clock is before the epoch
pub fn now_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "System clock is before UNIX epoch (1970-01-01), using timestamp 0"
            );
            0
        }
    }
}

// ============================================================================
// String Validation
// ============================================================================

pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate an identifier that may end up in a file name (thumbnails, job files)
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(anyhow!(
            "{} contains invalid characters (no path separators or '..' allowed)",
            field_name
        ));
    }

    Ok(())
}

pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    validate_non_empty(name, field_name)?;
    validate_length(name, MAX_NAME_LENGTH, field_name)?;
    Ok(())
}

/// Validate a camera source URL; it is handed to ffmpeg as an argument
pub fn validate_uri(uri: &str, field_name: &str) -> Result<()> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r'];
    if uri.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "{} contains dangerous shell metacharacters",
            field_name
        ));
    }

    Ok(())
}

// ============================================================================
// Path Validation
// ============================================================================

/// Resolve an existing media file, optionally requiring it to live under `base_dir`
pub fn validate_media_path(path: &Path, base_dir: Option<&Path>, field_name: &str) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("{} contains invalid UTF-8", field_name))?;
    validate_length(path_str, MAX_PATH_LENGTH, field_name)?;

    let canonical = path
        .canonicalize()
        .with_context(|| format!("{} does not exist or is inaccessible", field_name))?;

    if !canonical.is_file() {
        return Err(anyhow!("{} is not a regular file", field_name));
    }

    if let Some(base) = base_dir {
        let canonical_base = base
            .canonicalize()
            .with_context(|| format!("Base directory does not exist: {:?}", base))?;

        if !canonical.starts_with(&canonical_base) {
            return Err(anyhow!(
                "{} is outside allowed directory (path: {:?}, base: {:?})",
                field_name,
                canonical,
                canonical_base
            ));
        }
    }

    Ok(canonical)
}

// ============================================================================
// Numeric Validation
// ============================================================================

pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    // NaN fails both comparisons, so check containment explicitly
    if !(value >= min && value <= max) {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}
