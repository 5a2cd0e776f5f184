//! On-disk form of a feature: one YAML document per file.

use crate::error::{Error, Result};
use crate::models::Feature;

pub const RECORD_EXTENSION: &str = "yaml";

/// `<dir>/<slug>-<short id>.yaml`. The id suffix keeps two features with the
/// same name from colliding, and keeps renames on different branches from
/// producing add/add conflicts on merge.
pub fn record_path(metadata_dir: &str, feature: &Feature) -> String {
    format!(
        "{}/{}-{}.{}",
        metadata_dir,
        feature.slug(),
        feature.short_id(),
        RECORD_EXTENSION
    )
}

pub fn is_record_path(path: &str) -> bool {
    path.ends_with(".yaml") || path.ends_with(".yml")
}

/// Parse and structurally check one record.
pub fn parse_record(path: &str, bytes: &[u8]) -> Result<Feature> {
    let malformed = |reason: String| Error::Malformed {
        path: path.to_string(),
        reason,
    };
    let feature: Feature = serde_yaml::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    feature.check().map_err(malformed)?;
    Ok(feature)
}

pub fn serialize_record(feature: &Feature) -> Result<Vec<u8>> {
    Ok(serde_yaml::to_string(feature)?.into_bytes())
}
