//! Data model for the token pool (C3): `TokenInfo`, `TokenStatus`, `TokenPool`.
//!
//! Grounded on `app/services/grok/token.py`'s token record shape, generalized
//! to the richer field set from spec.md §3 (the source's single-file manager
//! folds several of these fields into loosely-typed dict keys; here they are
//! explicit struct fields with a tagged status enum instead).

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Consecutive-401 threshold after which a token is marked `expired`.
pub const MAX_FAILURE_COUNT: u32 = 5;

/// Per-request quota cost, mapped from a model descriptor's cost tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effort {
    Low,
    High,
}

impl Effort {
    pub fn cost(self) -> u32 {
        match self {
            Effort::Low => 1,
            Effort::High => 4,
        }
    }
}

/// Lifecycle state of one session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Cooling,
    Expired,
    Disabled,
}

/// One upstream credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    pub status: TokenStatus,
    pub quota: u32,
    pub created_at: u64,
    pub last_used_at: Option<u64>,
    pub last_sync_at: Option<u64>,
    pub last_fail_at: Option<u64>,
    pub last_asset_clear_at: Option<u64>,
    pub use_count: u64,
    pub fail_count: u32,
    pub last_fail_reason: Option<String>,
    pub tags: HashSet<String>,
}

impl TokenInfo {
    pub fn new(token: impl Into<String>, quota: u32, now_ms: u64) -> Self {
        let status = if quota > 0 {
            TokenStatus::Active
        } else {
            TokenStatus::Cooling
        };
        Self {
            token: token.into(),
            status,
            quota,
            created_at: now_ms,
            last_used_at: None,
            last_sync_at: None,
            last_fail_at: None,
            last_asset_clear_at: None,
            use_count: 0,
            fail_count: 0,
            last_fail_reason: None,
            tags: HashSet::new(),
        }
    }

    /// Recomputes `status` from `quota`, preserving `expired`/`disabled` as
    /// sticky states that only an admin action (not a quota change) clears.
    pub fn recompute_state(&mut self) {
        if matches!(self.status, TokenStatus::Expired | TokenStatus::Disabled) {
            return;
        }
        self.status = if self.quota > 0 {
            TokenStatus::Active
        } else {
            TokenStatus::Cooling
        };
    }
}

/// Named bag of tokens with insertion order preserved for deterministic
/// round-robin scanning.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenPool {
    #[serde(with = "ordered_map")]
    pub tokens: BTreeMap<u64, TokenInfo>,
    #[serde(skip)]
    next_seq: u64,
}

/// Custom `Deserialize` (rather than the derive) because `next_seq` is not
/// part of the wire format: it must be reconstructed from the highest
/// existing key, not defaulted to 0, or the next `insert` after a reload
/// overwrites token `0` and destroys the first entry of the pool.
impl<'de> Deserialize<'de> for TokenPool {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(with = "ordered_map")]
            tokens: BTreeMap<u64, TokenInfo>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let next_seq = raw.tokens.keys().next_back().map_or(0, |max| max + 1);
        Ok(TokenPool {
            tokens: raw.tokens,
            next_seq,
        })
    }
}

impl TokenPool {
    pub fn insert(&mut self, info: TokenInfo) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tokens.insert(seq, info);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenInfo> {
        self.tokens.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TokenInfo> {
        self.tokens.values_mut()
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut TokenInfo> {
        self.tokens.values_mut().find(|t| t.token == token)
    }

    pub fn remove(&mut self, token: &str) -> Option<TokenInfo> {
        let key = self
            .tokens
            .iter()
            .find(|(_, v)| v.token == token)
            .map(|(k, _)| *k)?;
        self.tokens.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Preserves insertion order across a `BTreeMap<u64, TokenInfo>` when
/// serialized, since `save_tokens(load_tokens())` must round-trip exactly
/// (spec.md §8 round-trip property) while still letting the map be keyed by
/// an internal sequence number rather than the token string itself.
mod ordered_map {
    use super::TokenInfo;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<u64, TokenInfo>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let values: Vec<&TokenInfo> = map.values().collect();
        values.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u64, TokenInfo>, D::Error> {
        let values: Vec<TokenInfo> = Vec::deserialize(deserializer)?;
        Ok(values.into_iter().enumerate().map(|(i, v)| (i as u64, v)).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn deserialized_pool_resumes_seq_after_max_existing_key() {
        let mut pool = TokenPool::default();
        pool.insert(TokenInfo::new("T1", 80, 0));
        pool.insert(TokenInfo::new("T2", 80, 0));
        pool.insert(TokenInfo::new("T3", 80, 0));

        let json = serde_json::to_string(&pool).unwrap();
        let mut reloaded: TokenPool = serde_json::from_str(&json).unwrap();

        reloaded.insert(TokenInfo::new("T4", 80, 0));
        let tokens: Vec<&str> = reloaded.iter().map(|t| t.token.as_str()).collect();
        assert_eq!(tokens, vec!["T1", "T2", "T3", "T4"]);
    }

    #[test]
    fn deserializing_an_empty_pool_starts_seq_at_zero() {
        let pool = TokenPool::default();
        let json = serde_json::to_string(&pool).unwrap();
        let mut reloaded: TokenPool = serde_json::from_str(&json).unwrap();
        reloaded.insert(TokenInfo::new("T1", 80, 0));
        assert_eq!(reloaded.iter().count(), 1);
    }
}
