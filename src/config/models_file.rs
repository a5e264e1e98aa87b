//! TOML-backed model table loader (ambient-stack supplement, SPEC_FULL §A).
//!
//! Grounded on the original's `core/config.py` static TOML config store: a
//! deployment can drop a `models.toml` file listing additional or
//! overriding model descriptors next to the YAML settings file, loaded on
//! top of [`crate::models::ModelTable::with_defaults`].

use std::path::Path;

use serde::Deserialize;

use crate::models::{ModelDescriptor, ModelTable};
use crate::token_pool::Effort;

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    model: Vec<ModelFileEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelFileEntry {
    external_id: String,
    upstream_model: String,
    upstream_mode: String,
    #[serde(default)]
    cost_tier: CostTierFile,
    #[serde(default)]
    pool_candidates: Vec<String>,
    #[serde(default)]
    is_image: bool,
    #[serde(default)]
    is_video: bool,
    #[serde(default)]
    requires_super: bool,
    #[serde(default)]
    upscale: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CostTierFile {
    #[default]
    Low,
    High,
}

impl From<CostTierFile> for Effort {
    fn from(value: CostTierFile) -> Self {
        match value {
            CostTierFile::Low => Effort::Low,
            CostTierFile::High => Effort::High,
        }
    }
}

/// Loads `path` if present, inserting/overriding entries into a fresh
/// default model table; missing or unreadable files fall back silently to
/// the built-in descriptor set (no admin surface depends on this existing).
pub fn load_model_table_file(path: &Path) -> ModelTable {
    let mut table = ModelTable::with_defaults();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return table,
    };
    let parsed: ModelsFile = match toml::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "failed to parse models.toml; using defaults");
            return table;
        }
    };
    for entry in parsed.model {
        table.insert(ModelDescriptor {
            external_id: entry.external_id,
            upstream_model: entry.upstream_model,
            upstream_mode: entry.upstream_mode,
            cost_tier: entry.cost_tier.into(),
            pool_candidates: entry.pool_candidates,
            is_image: entry.is_image,
            is_video: entry.is_video,
            requires_super: entry.requires_super,
            upscale: entry.upscale,
        });
    }
    table
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let table = load_model_table_file(Path::new("/nonexistent/models.toml"));
        assert!(table.get("grok-4-fast").is_some());
    }

    #[test]
    fn loads_additional_model_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.toml");
        std::fs::write(
            &path,
            r#"
[[model]]
external_id = "grok-4-custom"
upstream_model = "grok-4"
upstream_mode = "MODE_CUSTOM"
cost_tier = "high"
pool_candidates = ["ssoSuper"]
requires_super = true
"#,
        )
        .unwrap();
        let table = load_model_table_file(&path);
        let descriptor = table.get("grok-4-custom").unwrap();
        assert_eq!(descriptor.cost_tier, Effort::High);
        assert!(descriptor.requires_super);
        assert!(table.get("grok-4-fast").is_some());
    }
}
