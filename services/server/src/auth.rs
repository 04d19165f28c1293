//! Token and password handling.
//!
//! Bearer tokens are random 256-bit values handed to clients in the clear
//! and persisted only as SHA-256 hex digests. Password digests are salted
//! SHA-256 behind this module's two functions so a real KDF can be swapped
//! in without touching callers.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::store::{SessionRecord, Store, StoreError};
use concord_protocol::UserId;

pub fn hash_token(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn new_salt() -> String {
    random_hex(16)
}

/// Issue a fresh session for `user_id`, returning the raw token exactly once.
pub fn issue_session(store: &Store, user_id: UserId) -> Result<(String, SessionRecord), StoreError> {
    let raw_token = random_hex(32);
    let record = store.create_session(user_id, &hash_token(&raw_token))?;
    Ok((raw_token, record))
}

/// Resolve a raw bearer token to its session, if one exists and has not
/// expired.
pub fn validate_token(store: &Store, raw_token: &str) -> Result<Option<SessionRecord>, StoreError> {
    store.session_by_token_hash(&hash_token(raw_token))
}
