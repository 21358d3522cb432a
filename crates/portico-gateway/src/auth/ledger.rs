//! Ledger of issued refresh and password-reset tokens.
//!
//! Records are keyed by the BLAKE2b-256 fingerprint of the signed token; the
//! raw token is never stored. Every state change is a compare-and-swap on
//! the record bytes, so concurrent rotations of one token have exactly one
//! winner.

use blake2::{Blake2b, Digest, digest::consts::U32};
use chrono::{DateTime, Utc};
use portico_core::UserId;
use serde::{Deserialize, Serialize};

use super::{AuthError, TokenError};

const TOKENS_TREE: &str = "tokens";
const BY_USER_TREE: &str = "tokens_by_user";

type Blake2b256 = Blake2b<U32>;

/// BLAKE2b-256 fingerprint of a token, hex-encoded.
#[must_use]
pub fn fingerprint(token: &str) -> String {
    hex::encode(Blake2b256::digest(token.as_bytes()))
}

/// What a ledger entry may be redeemed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Session renewal.
    Refresh,
    /// Single-use password reset.
    ResetPassword,
}

/// A persisted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    /// Record ID.
    pub id: u64,
    /// Owning user.
    pub user_id: UserId,
    /// Token fingerprint.
    pub fingerprint: String,
    /// Token kind.
    pub kind: TokenKind,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Whether the token has been revoked or consumed.
    pub revoked: bool,
    /// When issued.
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Unrevoked and not yet expired.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Token ledger backed by sled.
#[derive(Clone)]
pub struct TokenLedger {
    db: sled::Db,
    tokens: sled::Tree,
    by_user: sled::Tree,
}

impl TokenLedger {
    /// Open the ledger trees in an existing sled database.
    ///
    /// # Errors
    ///
    /// Returns error if trees cannot be opened.
    pub fn new(db: &sled::Db) -> Result<Self, AuthError> {
        let tokens = db
            .open_tree(TOKENS_TREE)
            .map_err(|e| AuthError::Storage(format!("Failed to open tokens tree: {e}")))?;
        let by_user = db
            .open_tree(BY_USER_TREE)
            .map_err(|e| AuthError::Storage(format!("Failed to open token index: {e}")))?;

        Ok(Self {
            db: db.clone(),
            tokens,
            by_user,
        })
    }

    /// Record a newly issued token. Insert-only.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the token is already recorded, or `Storage`.
    pub fn persist(
        &self,
        user_id: UserId,
        token: &str,
        kind: TokenKind,
        expires_at: DateTime<Utc>,
    ) -> Result<TokenRecord, AuthError> {
        let record = TokenRecord {
            id: self.db.generate_id()?,
            user_id,
            fingerprint: fingerprint(token),
            kind,
            expires_at,
            revoked: false,
            created_at: Utc::now(),
        };

        let inserted = self.tokens.compare_and_swap(
            record.fingerprint.as_bytes(),
            None as Option<&[u8]>,
            Some(encode(&record)?),
        )?;
        if inserted.is_err() {
            return Err(AuthError::Conflict("Token already recorded".to_string()));
        }

        self.by_user
            .insert(user_key(user_id, &record.fingerprint), Vec::<u8>::new())?;

        tracing::debug!(user_id = %user_id, kind = ?kind, "Token persisted");
        Ok(record)
    }

    /// Look up a token regardless of its state.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn find(&self, token: &str) -> Result<Option<TokenRecord>, AuthError> {
        self.find_by_fingerprint(&fingerprint(token))
    }

    fn find_by_fingerprint(&self, fp: &str) -> Result<Option<TokenRecord>, AuthError> {
        self.tokens
            .get(fp.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Unrevoked record of the given kind. Expiry is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn lookup_valid(
        &self,
        token: &str,
        kind: TokenKind,
    ) -> Result<Option<TokenRecord>, AuthError> {
        Ok(self
            .find(token)?
            .filter(|r| !r.revoked && r.kind == kind))
    }

    /// Revoke a token. Unknown and already-revoked tokens succeed silently.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn revoke(&self, token: &str) -> Result<(), AuthError> {
        self.revoke_fingerprint(&fingerprint(token)).map(|_| ())
    }

    /// Returns whether this call flipped the flag.
    fn revoke_fingerprint(&self, fp: &str) -> Result<bool, AuthError> {
        loop {
            let Some(current) = self.tokens.get(fp.as_bytes())? else {
                return Ok(false);
            };
            let mut record = decode(&current)?;
            if record.revoked {
                return Ok(false);
            }
            record.revoked = true;

            if self
                .tokens
                .compare_and_swap(fp.as_bytes(), Some(current), Some(encode(&record)?))?
                .is_ok()
            {
                return Ok(true);
            }
        }
    }

    /// Revoke every token of `kind` owned by a user.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn revoke_all(&self, user_id: UserId, kind: TokenKind) -> Result<usize, AuthError> {
        let mut revoked = 0;
        for fp in self.fingerprints_of(user_id)? {
            let Some(record) = self.find_by_fingerprint(&fp)? else {
                continue;
            };
            if record.kind == kind && self.revoke_fingerprint(&fp)? {
                revoked += 1;
            }
        }
        if revoked > 0 {
            tracing::info!(user_id = %user_id, kind = ?kind, count = revoked, "Tokens revoked");
        }
        Ok(revoked)
    }

    /// Atomically redeem a single-use token.
    ///
    /// # Errors
    ///
    /// Returns `Token(Invalid)` for unknown or mismatched tokens,
    /// `Token(Expired)`, `Token(Revoked)` if already used, or
    /// `AlreadyRotated` if a concurrent redemption won.
    pub fn consume(&self, token: &str, kind: TokenKind) -> Result<TokenRecord, AuthError> {
        self.revoke_live(token, kind, None)
    }

    /// Replace `old` with `new` for `user_id`.
    ///
    /// The old token is revoked first. If recording the new token then
    /// fails, the user is left without a live refresh token and the error
    /// surfaces as `Storage`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRotated` to the loser of a concurrent rotation, the
    /// `Token` errors of [`TokenLedger::consume`], or `Storage`.
    pub fn rotate(
        &self,
        user_id: UserId,
        old: &str,
        new: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<TokenRecord, AuthError> {
        self.revoke_live(old, TokenKind::Refresh, Some(user_id))?;

        self.persist(user_id, new, TokenKind::Refresh, expires_at)
            .map_err(|e| {
                tracing::error!(user_id = %user_id, error = %e, "Rotation revoked old token but failed to record new one");
                AuthError::Storage(format!("Rotation failed after revoke: {e}"))
            })
    }

    fn revoke_live(
        &self,
        token: &str,
        kind: TokenKind,
        owner: Option<UserId>,
    ) -> Result<TokenRecord, AuthError> {
        let fp = fingerprint(token);
        let current = self
            .tokens
            .get(fp.as_bytes())?
            .ok_or(TokenError::Invalid)?;
        let mut record = decode(&current)?;

        if record.kind != kind || owner.is_some_and(|id| id != record.user_id) {
            return Err(TokenError::Invalid.into());
        }
        if record.revoked {
            return Err(TokenError::Revoked.into());
        }
        if record.expires_at <= Utc::now() {
            return Err(TokenError::Expired.into());
        }

        record.revoked = true;
        match self
            .tokens
            .compare_and_swap(fp.as_bytes(), Some(current), Some(encode(&record)?))?
        {
            Ok(()) => Ok(record),
            Err(_) => Err(AuthError::AlreadyRotated),
        }
    }

    /// Number of unrevoked, unexpired tokens of `kind` for a user.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn live_count(&self, user_id: UserId, kind: TokenKind) -> Result<usize, AuthError> {
        let now = Utc::now();
        let mut count = 0;
        for fp in self.fingerprints_of(user_id)? {
            if let Some(record) = self.find_by_fingerprint(&fp)? {
                if record.kind == kind && record.is_live(now) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Physically remove tokens that are revoked and expired before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, AuthError> {
        let mut purged = 0;
        for entry in self.tokens.iter() {
            let (key, value) = entry?;
            let record = decode(&value)?;
            if !(record.revoked && record.expires_at < cutoff) {
                continue;
            }
            // Only remove the exact bytes we inspected.
            if self
                .tokens
                .compare_and_swap(&key, Some(value), None as Option<&[u8]>)?
                .is_ok()
            {
                self.by_user
                    .remove(user_key(record.user_id, &record.fingerprint))?;
                purged += 1;
            }
        }
        tracing::info!(count = purged, cutoff = %cutoff, "Purged expired tokens");
        Ok(purged)
    }

    /// Total records, including revoked ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the ledger holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn fingerprints_of(&self, user_id: UserId) -> Result<Vec<String>, AuthError> {
        let prefix = user_id.to_key();
        let mut out = Vec::new();
        for entry in self.by_user.scan_prefix(prefix) {
            let (key, _) = entry?;
            out.push(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TokenLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLedger")
            .field("records", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

fn user_key(user_id: UserId, fp: &str) -> Vec<u8> {
    let mut key = user_id.to_key().to_vec();
    key.extend_from_slice(fp.as_bytes());
    key
}

fn encode(record: &TokenRecord) -> Result<Vec<u8>, AuthError> {
    serde_json::to_vec(record).map_err(|e| AuthError::Storage(format!("Serialization error: {e}")))
}

fn decode(bytes: &[u8]) -> Result<TokenRecord, AuthError> {
    serde_json::from_slice(bytes)
        .map_err(|e| AuthError::Storage(format!("Deserialization error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn open_ledger() -> (TempDir, TokenLedger) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, TokenLedger::new(&db).unwrap())
    }

    fn in_days(days: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(days)
    }

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = fingerprint("token");
        assert_eq!(a.len(), 64);
        assert_eq!(a, fingerprint("token"));
        assert_ne!(a, fingerprint("token2"));
    }

    #[test]
    fn test_persist_and_lookup() {
        let (_dir, ledger) = open_ledger();
        let record = ledger
            .persist(ALICE, "t1", TokenKind::Refresh, in_days(7))
            .unwrap();
        assert!(!record.revoked);
        assert_ne!(record.fingerprint, "t1");

        assert!(ledger.lookup_valid("t1", TokenKind::Refresh).unwrap().is_some());
        assert!(ledger
            .lookup_valid("t1", TokenKind::ResetPassword)
            .unwrap()
            .is_none());
        assert!(ledger.lookup_valid("t2", TokenKind::Refresh).unwrap().is_none());
    }

    #[test]
    fn test_persist_is_insert_only() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "t1", TokenKind::Refresh, in_days(7))
            .unwrap();
        assert!(matches!(
            ledger.persist(ALICE, "t1", TokenKind::Refresh, in_days(7)),
            Err(AuthError::Conflict(_))
        ));
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "t1", TokenKind::Refresh, in_days(7))
            .unwrap();
        ledger.revoke("t1").unwrap();
        ledger.revoke("t1").unwrap();
        ledger.revoke("never-issued").unwrap();

        assert!(ledger.find("t1").unwrap().unwrap().revoked);
        assert!(ledger.lookup_valid("t1", TokenKind::Refresh).unwrap().is_none());
    }

    #[test]
    fn test_rotate() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "t1", TokenKind::Refresh, in_days(7))
            .unwrap();

        ledger.rotate(ALICE, "t1", "t2", in_days(7)).unwrap();
        assert!(ledger.find("t1").unwrap().unwrap().revoked);
        assert!(ledger.lookup_valid("t2", TokenKind::Refresh).unwrap().is_some());
        assert_eq!(ledger.live_count(ALICE, TokenKind::Refresh).unwrap(), 1);
    }

    #[test]
    fn test_rotate_failing_to_record_leaves_no_live_token() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "t1", TokenKind::Refresh, in_days(7))
            .unwrap();

        // Reusing the old token as the new one collides on insert.
        assert!(matches!(
            ledger.rotate(ALICE, "t1", "t1", in_days(7)),
            Err(AuthError::Storage(_))
        ));
        assert!(ledger.find("t1").unwrap().unwrap().revoked);
        assert_eq!(ledger.live_count(ALICE, TokenKind::Refresh).unwrap(), 0);
    }

    #[test]
    fn test_rotate_after_revoke_fails() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "t1", TokenKind::Refresh, in_days(7))
            .unwrap();
        ledger.revoke("t1").unwrap();

        assert!(matches!(
            ledger.rotate(ALICE, "t1", "t2", in_days(7)),
            Err(AuthError::Token(TokenError::Revoked))
        ));
        assert!(ledger.find("t2").unwrap().is_none());
    }

    #[test]
    fn test_rotate_rejects_other_owner() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "t1", TokenKind::Refresh, in_days(7))
            .unwrap();

        assert!(matches!(
            ledger.rotate(BOB, "t1", "t2", in_days(7)),
            Err(AuthError::Token(TokenError::Invalid))
        ));
        assert!(!ledger.find("t1").unwrap().unwrap().revoked);
    }

    #[test]
    fn test_concurrent_rotation_has_one_winner() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "t1", TokenKind::Refresh, in_days(7))
            .unwrap();

        const RACERS: usize = 8;
        let barrier = Barrier::new(RACERS);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..RACERS)
                .map(|i| {
                    let ledger = &ledger;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        ledger.rotate(ALICE, "t1", &format!("next-{i}"), in_days(7))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for loser in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(
                loser,
                AuthError::AlreadyRotated | AuthError::Token(TokenError::Revoked)
            ));
        }
        assert_eq!(ledger.live_count(ALICE, TokenKind::Refresh).unwrap(), 1);
    }

    #[test]
    fn test_consume_is_single_use() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "reset", TokenKind::ResetPassword, in_days(1))
            .unwrap();

        assert!(matches!(
            ledger.consume("reset", TokenKind::Refresh),
            Err(AuthError::Token(TokenError::Invalid))
        ));
        let record = ledger.consume("reset", TokenKind::ResetPassword).unwrap();
        assert_eq!(record.user_id, ALICE);
        assert!(matches!(
            ledger.consume("reset", TokenKind::ResetPassword),
            Err(AuthError::Token(TokenError::Revoked))
        ));
    }

    #[test]
    fn test_consume_expired() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "old", TokenKind::ResetPassword, in_days(-1))
            .unwrap();
        assert!(matches!(
            ledger.consume("old", TokenKind::ResetPassword),
            Err(AuthError::Token(TokenError::Expired))
        ));
    }

    #[test]
    fn test_revoke_all_by_kind() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "r1", TokenKind::Refresh, in_days(7))
            .unwrap();
        ledger
            .persist(ALICE, "r2", TokenKind::Refresh, in_days(7))
            .unwrap();
        ledger
            .persist(ALICE, "p1", TokenKind::ResetPassword, in_days(1))
            .unwrap();
        ledger
            .persist(BOB, "b1", TokenKind::Refresh, in_days(7))
            .unwrap();

        assert_eq!(ledger.revoke_all(ALICE, TokenKind::Refresh).unwrap(), 2);
        assert_eq!(ledger.revoke_all(ALICE, TokenKind::Refresh).unwrap(), 0);
        assert_eq!(ledger.live_count(ALICE, TokenKind::Refresh).unwrap(), 0);
        assert_eq!(ledger.live_count(ALICE, TokenKind::ResetPassword).unwrap(), 1);
        assert_eq!(ledger.live_count(BOB, TokenKind::Refresh).unwrap(), 1);
    }

    #[test]
    fn test_purge_expired() {
        let (_dir, ledger) = open_ledger();
        ledger
            .persist(ALICE, "dead", TokenKind::Refresh, in_days(-2))
            .unwrap();
        ledger.revoke("dead").unwrap();
        ledger
            .persist(ALICE, "expired-unrevoked", TokenKind::Refresh, in_days(-2))
            .unwrap();
        ledger
            .persist(ALICE, "live", TokenKind::Refresh, in_days(7))
            .unwrap();
        ledger.revoke("live").unwrap();

        assert_eq!(ledger.purge_expired(Utc::now()).unwrap(), 1);
        assert!(ledger.find("dead").unwrap().is_none());
        assert!(ledger.find("expired-unrevoked").unwrap().is_some());
        assert!(ledger.find("live").unwrap().is_some());
        assert_eq!(ledger.len(), 2);
    }
}
