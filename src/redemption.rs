//! One-time order-redemption token store.
//!
//! Tokens are keyed by (normalized order id, product id) and expire 72
//! hours after creation. Creating a token for an existing live record
//! returns the same token; an expired record has its token refreshed in
//! place; a redeemed record refuses new tokens. State is one JSON file.

use crate::error::{BrokerError, Result};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Token lifetime from creation.
const TOKEN_TTL_HOURS: i64 = 72;

/// Random bytes per token (hex-encoded on output).
const TOKEN_BYTES: usize = 32;

/// A stored redemption record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRecord {
    pub order_id: String,
    pub product_id: String,
    pub email: String,
    pub token: String,
    pub redeemed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl RedemptionRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::hours(TOKEN_TTL_HOURS)
    }
}

/// Persisted file layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: Vec<RedemptionRecord>,
}

/// Result of a token creation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_redeemed: bool,
}

/// Validation verdict for a presented token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Valid,
    NotFound,
    Expired,
    Redeemed,
}

/// Normalize an order id: trim, lowercase, strip non-alphanumerics.
#[must_use]
pub fn normalize_order_id(order_id: &str) -> String {
    order_id
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// File-backed redemption token store.
#[derive(Debug)]
pub struct RedemptionStore {
    path: PathBuf,
    records: Mutex<Vec<RedemptionRecord>>,
}

impl RedemptionStore {
    /// Load the store from `path`, starting empty when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let records = match std::fs::read_to_string(path) {
            Ok(raw) => {
                serde_json::from_str::<StoreFile>(&raw)
                    .map_err(|e| BrokerError::Redemption(format!("corrupt store: {e}")))?
                    .records
            }
            Err(_) => Vec::new(),
        };
        Ok(Self {
            path: path.to_owned(),
            records: Mutex::new(records),
        })
    }

    /// Create a token for (order, product) or return the live existing one.
    ///
    /// - No record: create with a fresh random token.
    /// - Live record: return the same token.
    /// - Expired record: refresh the token in place, resetting creation.
    /// - Redeemed record: refuse.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be persisted.
    pub fn create_or_reuse_token(
        &self,
        order_id: &str,
        product_id: &str,
        email: &str,
    ) -> Result<TokenOutcome> {
        let key = normalize_order_id(order_id);
        let now = Utc::now();
        let outcome = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let existing = records
                .iter_mut()
                .find(|r| normalize_order_id(&r.order_id) == key && r.product_id == product_id);

            match existing {
                Some(record) if record.redeemed => TokenOutcome {
                    success: false,
                    token: None,
                    already_redeemed: true,
                },
                Some(record) if record.is_expired(now) => {
                    record.token = generate_token();
                    record.created_at = now;
                    TokenOutcome {
                        success: true,
                        token: Some(record.token.clone()),
                        already_redeemed: false,
                    }
                }
                Some(record) => TokenOutcome {
                    success: true,
                    token: Some(record.token.clone()),
                    already_redeemed: false,
                },
                None => {
                    let record = RedemptionRecord {
                        order_id: order_id.trim().to_owned(),
                        product_id: product_id.to_owned(),
                        email: email.to_owned(),
                        token: generate_token(),
                        redeemed: false,
                        created_at: now,
                        redeemed_at: None,
                    };
                    let token = record.token.clone();
                    records.push(record);
                    TokenOutcome {
                        success: true,
                        token: Some(token),
                        already_redeemed: false,
                    }
                }
            }
        };
        self.persist()?;
        Ok(outcome)
    }

    /// Validate a presented token.
    #[must_use]
    pub fn validate_token(&self, token: &str) -> TokenStatus {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = records.iter().find(|r| r.token == token) else {
            return TokenStatus::NotFound;
        };
        if record.redeemed {
            return TokenStatus::Redeemed;
        }
        if record.is_expired(Utc::now()) {
            return TokenStatus::Expired;
        }
        TokenStatus::Valid
    }

    /// Mark a token redeemed. Idempotent: re-marking is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns an error when the token is unknown or the store cannot be
    /// persisted.
    pub fn mark_redeemed(&self, token: &str) -> Result<()> {
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let record = records
                .iter_mut()
                .find(|r| r.token == token)
                .ok_or_else(|| BrokerError::Redemption("unknown token".into()))?;
            if !record.redeemed {
                record.redeemed = true;
                record.redeemed_at = Some(Utc::now());
            }
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let snapshot = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            StoreFile {
                records: records.clone(),
            }
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| BrokerError::Redemption(format!("serialize store: {e}")))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> RedemptionStore {
        RedemptionStore::load(&dir.path().join("redemptions.json")).unwrap()
    }

    #[test]
    fn normalization_round_trip() {
        assert_eq!(normalize_order_id(" ORD-001 "), "ord001");
        assert_eq!(normalize_order_id("ord 001"), "ord001");
        // Applying twice equals applying once.
        let once = normalize_order_id("AB-12 cd");
        assert_eq!(normalize_order_id(&once), once);
    }

    #[test]
    fn token_is_reused_while_live() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);
        let first = tokens.create_or_reuse_token("ORD-001", "P1", "a@x").unwrap();
        let second = tokens.create_or_reuse_token("ORD-001", "P1", "a@x").unwrap();
        assert!(first.success);
        assert_eq!(first.token, second.token);
    }

    #[test]
    fn products_get_distinct_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);
        let p1 = tokens.create_or_reuse_token("ORD-001", "P1", "a@x").unwrap();
        let p2 = tokens.create_or_reuse_token("ORD-001", "P2", "a@x").unwrap();
        assert_ne!(p1.token, p2.token);
    }

    #[test]
    fn full_lifecycle_with_normalized_rematch() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);
        let outcome = tokens.create_or_reuse_token("ORD-001", "P1", "a@x").unwrap();
        let token = outcome.token.unwrap();

        assert_eq!(tokens.validate_token(&token), TokenStatus::Valid);
        tokens.mark_redeemed(&token).unwrap();
        assert_eq!(tokens.validate_token(&token), TokenStatus::Redeemed);

        // Same order under a different spelling hits the redeemed record.
        let again = tokens.create_or_reuse_token("ord 001", "P1", "a@x").unwrap();
        assert!(!again.success);
        assert!(again.already_redeemed);
        assert!(again.token.is_none());
    }

    #[test]
    fn mark_redeemed_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);
        let token = tokens
            .create_or_reuse_token("ORD-9", "P1", "a@x")
            .unwrap()
            .token
            .unwrap();
        tokens.mark_redeemed(&token).unwrap();
        tokens.mark_redeemed(&token).unwrap();
        assert_eq!(tokens.validate_token(&token), TokenStatus::Redeemed);
    }

    #[test]
    fn unknown_token_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);
        assert_eq!(tokens.validate_token("nope"), TokenStatus::NotFound);
        assert!(tokens.mark_redeemed("nope").is_err());
    }

    #[test]
    fn expired_record_refreshes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);
        let first = tokens
            .create_or_reuse_token("ORD-2", "P1", "a@x")
            .unwrap()
            .token
            .unwrap();

        // Backdate the record past the TTL.
        {
            let mut records = tokens.records.lock().unwrap();
            records[0].created_at = Utc::now() - Duration::hours(TOKEN_TTL_HOURS + 1);
        }
        assert_eq!(tokens.validate_token(&first), TokenStatus::Expired);

        let refreshed = tokens
            .create_or_reuse_token("ORD-2", "P1", "a@x")
            .unwrap()
            .token
            .unwrap();
        assert_ne!(first, refreshed);
        assert_eq!(tokens.validate_token(&refreshed), TokenStatus::Valid);
        // The stale token no longer resolves.
        assert_eq!(tokens.validate_token(&first), TokenStatus::NotFound);
    }

    #[test]
    fn store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let tokens = store(&dir);
            tokens
                .create_or_reuse_token("ORD-3", "P1", "a@x")
                .unwrap()
                .token
                .unwrap()
        };
        let reloaded = store(&dir);
        assert_eq!(reloaded.validate_token(&token), TokenStatus::Valid);
    }
}
