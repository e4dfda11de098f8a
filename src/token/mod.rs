//! Short-lived transfer tokens gating the data-plane socket.
//!
//! A token is scoped to one operation on one dataset/snapshot pair. Claims
//! live in the key-value store under the token id with an absolute expiry;
//! the id itself is the secret (128 bits from the OS RNG). A non-resumable
//! token validates exactly once; a resumable one validates repeatedly
//! within its ttl, which is what lets an interrupted transfer reconnect.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, ZmigrateError};
use crate::store::KvStore;

const TOKEN_KEY_PREFIX: &str = "token:";
const STATS_KEY: &str = "token:stats";

/// Visible part of a token id in listings and logs.
pub const ID_PREVIEW_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Send,
    Receive,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Send => "send",
            Operation::Receive => "receive",
        }
    }
}

/// Transfer flags bound into a token at issue time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferFlags {
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub resumable: bool,
    #[serde(default)]
    pub force: bool,
    /// Incremental base snapshot for send operations.
    #[serde(default)]
    pub from_snapshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub id: String,
    pub operation: Operation,
    pub dataset: String,
    #[serde(default)]
    pub snapshot: Option<String>,
    pub flags: TransferFlags,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub used: bool,
    #[serde(default)]
    pub use_count: u64,
}

/// Redacted view returned by listings; never carries the full secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSummary {
    pub id_prefix: String,
    pub operation: Operation,
    pub dataset: String,
    #[serde(default)]
    pub snapshot: Option<String>,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub use_count: u64,
}

#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn KvStore>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Issues a token bound to one operation and one dataset/snapshot.
    pub async fn issue(
        &self,
        operation: Operation,
        dataset: &str,
        snapshot: Option<&str>,
        flags: TransferFlags,
        owner: &str,
        ttl: Duration,
    ) -> Result<TokenClaims> {
        if ttl.is_zero() {
            return Err(ZmigrateError::Validation("token ttl must be positive".into()));
        }
        if dataset.is_empty() {
            return Err(ZmigrateError::Validation("token dataset is required".into()));
        }
        if operation == Operation::Send && snapshot.is_none() {
            return Err(ZmigrateError::Validation(
                "send tokens require a snapshot".into(),
            ));
        }

        let mut secret = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let id = hex::encode(secret);

        let now = Utc::now();
        let claims = TokenClaims {
            id: id.clone(),
            operation,
            dataset: dataset.to_string(),
            snapshot: snapshot.map(str::to_string),
            flags,
            owner: owner.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            used: false,
            use_count: 0,
        };

        self.save(&claims, ttl).await?;
        self.store
            .incr(STATS_KEY, &format!("created_{}", operation.as_str()))
            .await?;
        info!(
            token = %preview(&id),
            operation = operation.as_str(),
            dataset,
            owner,
            "Token issued"
        );
        Ok(claims)
    }

    /// Validates a token and records the use. Fails for absent, expired, or
    /// revoked tokens, and for reuse of a non-resumable token.
    pub async fn validate(&self, token_id: &str) -> Result<TokenClaims> {
        let key = format!("{TOKEN_KEY_PREFIX}{token_id}");
        let Some(json) = self.store.get(&key).await? else {
            self.store.incr(STATS_KEY, "validation_failed").await?;
            return Err(ZmigrateError::TokenInvalid("unknown or revoked token".into()));
        };
        let mut claims: TokenClaims = serde_json::from_str(&json)
            .map_err(|e| ZmigrateError::Store(format!("deserialize token: {e}")))?;

        let now = Utc::now();
        if now >= claims.expires_at {
            self.store.delete(&key).await?;
            self.store.incr(STATS_KEY, "validation_failed").await?;
            return Err(ZmigrateError::TokenInvalid("token expired".into()));
        }
        if claims.used && !claims.flags.resumable {
            self.store.incr(STATS_KEY, "validation_failed").await?;
            return Err(ZmigrateError::TokenInvalid(
                "token already used and not resumable".into(),
            ));
        }

        claims.used = true;
        claims.use_count += 1;
        let remaining = (claims.expires_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        self.save(&claims, remaining).await?;
        self.store.incr(STATS_KEY, "validation_ok").await?;
        debug!(token = %preview(token_id), use_count = claims.use_count, "Token validated");
        Ok(claims)
    }

    /// Invalidates immediately regardless of remaining ttl.
    pub async fn revoke(&self, token_id: &str) -> Result<bool> {
        let removed = self
            .store
            .delete(&format!("{TOKEN_KEY_PREFIX}{token_id}"))
            .await?;
        if removed {
            self.store.incr(STATS_KEY, "revoked").await?;
            info!(token = %preview(token_id), "Token revoked");
        }
        Ok(removed)
    }

    /// Unexpired tokens for one owner, secrets redacted to a prefix.
    pub async fn list(&self, owner: &str) -> Result<Vec<TokenSummary>> {
        let mut summaries = Vec::new();
        for key in self.store.keys(TOKEN_KEY_PREFIX).await? {
            if key == STATS_KEY {
                continue;
            }
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(claims) = serde_json::from_str::<TokenClaims>(&json) else {
                continue;
            };
            if claims.owner != owner || Utc::now() >= claims.expires_at {
                continue;
            }
            summaries.push(TokenSummary {
                id_prefix: preview(&claims.id),
                operation: claims.operation,
                dataset: claims.dataset,
                snapshot: claims.snapshot,
                owner: claims.owner,
                expires_at: claims.expires_at,
                used: claims.used,
                use_count: claims.use_count,
            });
        }
        summaries.sort_by_key(|s| s.expires_at);
        Ok(summaries)
    }

    async fn save(&self, claims: &TokenClaims, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(claims)
            .map_err(|e| ZmigrateError::Store(format!("serialize token: {e}")))?;
        self.store
            .set_ex(&format!("{TOKEN_KEY_PREFIX}{}", claims.id), &json, ttl)
            .await
    }
}

fn preview(id: &str) -> String {
    id.chars().take(ID_PREVIEW_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> TokenManager {
        TokenManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn issue_rejects_zero_ttl() {
        let mgr = manager();
        let err = mgr
            .issue(
                Operation::Send,
                "pool/data",
                Some("s1"),
                TransferFlags::default(),
                "alice",
                Duration::ZERO,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ZmigrateError::Validation(_)));
    }

    #[tokio::test]
    async fn token_id_has_enough_entropy() {
        let mgr = manager();
        let claims = mgr
            .issue(
                Operation::Receive,
                "pool/data",
                None,
                TransferFlags::default(),
                "alice",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        // 16 random bytes hex-encoded.
        assert_eq!(claims.id.len(), 32);
    }

    #[tokio::test]
    async fn non_resumable_token_validates_once() {
        let mgr = manager();
        let claims = mgr
            .issue(
                Operation::Send,
                "pool/data",
                Some("s1"),
                TransferFlags::default(),
                "alice",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(mgr.validate(&claims.id).await.is_ok());
        let err = mgr.validate(&claims.id).await.unwrap_err();
        assert!(matches!(err, ZmigrateError::TokenInvalid(_)));
    }

    #[tokio::test]
    async fn resumable_token_validates_repeatedly() {
        let mgr = manager();
        let flags = TransferFlags {
            resumable: true,
            ..Default::default()
        };
        let claims = mgr
            .issue(
                Operation::Send,
                "pool/data",
                Some("s1"),
                flags,
                "alice",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        for expected in 1..=3 {
            let validated = mgr.validate(&claims.id).await.unwrap();
            assert_eq!(validated.use_count, expected);
        }
    }

    #[tokio::test]
    async fn expired_token_always_fails() {
        let mgr = manager();
        let claims = mgr
            .issue(
                Operation::Send,
                "pool/data",
                Some("s1"),
                TransferFlags::default(),
                "alice",
                Duration::from_millis(20),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mgr.validate(&claims.id).await.is_err());
    }

    #[tokio::test]
    async fn revoke_invalidates_immediately() {
        let mgr = manager();
        let claims = mgr
            .issue(
                Operation::Receive,
                "pool/data",
                None,
                TransferFlags::default(),
                "alice",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(mgr.revoke(&claims.id).await.unwrap());
        assert!(mgr.validate(&claims.id).await.is_err());
        assert!(!mgr.revoke(&claims.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_redacts_secret_and_scopes_to_owner() {
        let mgr = manager();
        let claims = mgr
            .issue(
                Operation::Send,
                "pool/data",
                Some("s1"),
                TransferFlags::default(),
                "alice",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        mgr.issue(
            Operation::Send,
            "pool/other",
            Some("s1"),
            TransferFlags::default(),
            "bob",
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let listed = mgr.list("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id_prefix, claims.id[..ID_PREVIEW_LEN]);
        assert_ne!(listed[0].id_prefix, claims.id);
    }
}
