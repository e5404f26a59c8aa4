//! Human-readable configuration loading, layered over the authoritative
//! binary statistics format.

use std::fs;
use std::path::Path;

use crate::asm::AsmConfiguration;
use crate::error::{GuideError, Result};

/// Loads an `AsmConfiguration` from a JSON file on disk. The binary wire
/// format in `suffstats`/`sample` remains authoritative for persisted
/// fitter state; this is the convenience path for operators tuning the
/// split/merge thresholds between runs.
pub fn load_asm_configuration(path: &Path) -> Result<AsmConfiguration> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| GuideError::SerializationMismatch {
        reason: format!("invalid configuration JSON: {e}"),
    })
}

pub fn save_asm_configuration(path: &Path, cfg: &AsmConfiguration) -> Result<()> {
    let text = serde_json::to_string_pretty(cfg).map_err(|e| GuideError::SerializationMismatch {
        reason: format!("failed to serialise configuration: {e}"),
    })?;
    fs::write(path, text)?;
    Ok(())
}
