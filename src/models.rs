//! Model descriptor table and Routing Policy (C8).
//!
//! Grounded on the original's per-model config blocks under `core/config.py`
//! (`grok` section's model map) and spec.md §3/§4.8: a static table mapping
//! an external model id to upstream name/mode, cost tier, ordered pool
//! candidates, and capability flags, plus the pure routing functions over it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::token_pool::Effort;

pub const POOL_BASIC: &str = "ssoBasic";
pub const POOL_SUPER: &str = "ssoSuper";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub external_id: String,
    pub upstream_model: String,
    pub upstream_mode: String,
    pub cost_tier: Effort,
    pub pool_candidates: Vec<String>,
    pub is_image: bool,
    pub is_video: bool,
    pub requires_super: bool,
    pub upscale: bool,
}

/// Static model table. A real deployment loads this from config; the
/// defaults here mirror the original's Grok chat/image/video model set
/// closely enough to exercise C8/C9 without external config.
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    models: HashMap<String, ModelDescriptor>,
}

impl ModelTable {
    pub fn with_defaults() -> Self {
        let mut models = HashMap::new();
        for descriptor in default_descriptors() {
            models.insert(descriptor.external_id.clone(), descriptor);
        }
        Self { models }
    }

    pub fn insert(&mut self, descriptor: ModelDescriptor) {
        self.models.insert(descriptor.external_id.clone(), descriptor);
    }

    pub fn get(&self, external_id: &str) -> Option<&ModelDescriptor> {
        self.models.get(external_id)
    }

    pub fn list(&self) -> Vec<&ModelDescriptor> {
        let mut out: Vec<&ModelDescriptor> = self.models.values().collect();
        out.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        out
    }
}

fn default_descriptors() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            external_id: "grok-4-fast".to_string(),
            upstream_model: "grok-4-fast".to_string(),
            upstream_mode: "MODE_FAST".to_string(),
            cost_tier: Effort::Low,
            pool_candidates: vec![POOL_BASIC.to_string(), POOL_SUPER.to_string()],
            is_image: false,
            is_video: false,
            requires_super: false,
            upscale: false,
        },
        ModelDescriptor {
            external_id: "grok-4-fast-expert".to_string(),
            upstream_model: "grok-4-fast".to_string(),
            upstream_mode: "MODE_EXPERT".to_string(),
            cost_tier: Effort::High,
            pool_candidates: vec![POOL_SUPER.to_string()],
            is_image: false,
            is_video: false,
            requires_super: true,
            upscale: false,
        },
        ModelDescriptor {
            external_id: "grok-image".to_string(),
            upstream_model: "grok-image".to_string(),
            upstream_mode: "MODE_IMAGE".to_string(),
            cost_tier: Effort::Low,
            pool_candidates: vec![POOL_BASIC.to_string(), POOL_SUPER.to_string()],
            is_image: true,
            is_video: false,
            requires_super: false,
            upscale: false,
        },
        ModelDescriptor {
            external_id: "grok-video".to_string(),
            upstream_model: "grok-video".to_string(),
            upstream_mode: "MODE_VIDEO".to_string(),
            cost_tier: Effort::High,
            pool_candidates: vec![POOL_SUPER.to_string()],
            is_image: false,
            is_video: true,
            requires_super: true,
            upscale: true,
        },
    ]
}

/// Deterministic ordered pool-candidate list for a model; video models asking
/// for 720p or >6s get the super pool moved to the front.
pub fn pool_candidates_for_model(
    descriptor: &ModelDescriptor,
    resolution: Option<&str>,
    length_secs: Option<u32>,
) -> Vec<String> {
    if descriptor.is_video {
        let requires_super =
            resolution == Some("720p") || length_secs.is_some_and(|l| l > 6);
        if requires_super {
            let mut candidates = descriptor.pool_candidates.clone();
            if let Some(pos) = candidates.iter().position(|p| p == POOL_SUPER) {
                let super_pool = candidates.remove(pos);
                candidates.insert(0, super_pool);
            }
            return candidates;
        }
    }
    descriptor.pool_candidates.clone()
}

pub fn effort_for_model(descriptor: &ModelDescriptor) -> Effort {
    descriptor.cost_tier
}

pub fn is_image(descriptor: &ModelDescriptor) -> bool {
    descriptor.is_image
}

pub fn is_video(descriptor: &ModelDescriptor) -> bool {
    descriptor.is_video
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn video_720p_prefers_super_pool() {
        let table = ModelTable::with_defaults();
        let descriptor = ModelDescriptor {
            pool_candidates: vec![POOL_BASIC.to_string(), POOL_SUPER.to_string()],
            ..table.get("grok-video").unwrap().clone()
        };
        let candidates = pool_candidates_for_model(&descriptor, Some("720p"), Some(4));
        assert_eq!(candidates[0], POOL_SUPER);
    }

    #[test]
    fn video_long_length_prefers_super_pool() {
        let table = ModelTable::with_defaults();
        let descriptor = ModelDescriptor {
            pool_candidates: vec![POOL_BASIC.to_string(), POOL_SUPER.to_string()],
            ..table.get("grok-video").unwrap().clone()
        };
        let candidates = pool_candidates_for_model(&descriptor, Some("480p"), Some(10));
        assert_eq!(candidates[0], POOL_SUPER);
    }

    #[test]
    fn short_480p_video_keeps_declared_order() {
        let table = ModelTable::with_defaults();
        let descriptor = ModelDescriptor {
            pool_candidates: vec![POOL_BASIC.to_string(), POOL_SUPER.to_string()],
            ..table.get("grok-video").unwrap().clone()
        };
        let candidates = pool_candidates_for_model(&descriptor, Some("480p"), Some(6));
        assert_eq!(candidates[0], POOL_BASIC);
    }
}
