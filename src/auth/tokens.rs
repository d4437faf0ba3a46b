use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use super::repo::{StoreError, TokenStore};
use super::repo_types::{Purge, Scope};
use crate::validator::Validator;

const TOKEN_BYTES: usize = 16;

/// Length of the base32 plaintext handed to clients.
pub const TOKEN_PLAINTEXT_LEN: usize = 26;

/// A freshly issued token. `plaintext` exists only on this value; the store
/// keeps `hash`.
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    #[serde(rename = "token")]
    pub plaintext: String,
    #[serde(skip)]
    pub hash: Vec<u8>,
    #[serde(skip)]
    pub user_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry: OffsetDateTime,
    #[serde(skip)]
    pub scope: Scope,
    #[serde(skip)]
    pub created_at: OffsetDateTime,
}

impl Token {
    pub fn generate(user_id: Uuid, ttl: Duration, scope: Scope) -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let plaintext = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes);
        let hash = hash_token(&plaintext);
        let now = OffsetDateTime::now_utc();
        Self {
            plaintext,
            hash,
            user_id,
            expiry: now + ttl,
            scope,
            created_at: now,
        }
    }
}

/// SHA-256 of the plaintext. Tokens carry their own entropy, so a fast
/// digest is enough for lookup.
pub fn hash_token(plaintext: &str) -> Vec<u8> {
    Sha256::digest(plaintext.as_bytes()).to_vec()
}

pub fn validate_token_plaintext(v: &mut Validator, field: &str, plaintext: &str) {
    v.check(!plaintext.is_empty(), field, "must be provided");
    v.check(
        plaintext.len() == TOKEN_PLAINTEXT_LEN,
        field,
        "must be 26 bytes long",
    );
}

/// Generates a token and stores it, dropping every older token of the same
/// scope for that user in the same transaction.
pub async fn issue_token(
    store: &dyn TokenStore,
    user_id: Uuid,
    ttl: Duration,
    scope: Scope,
) -> Result<Token, StoreError> {
    let token = Token::generate(user_id, ttl, scope);
    store.replace(&token, Purge::Scope).await?;
    debug!(user_id = %user_id, scope = %scope, "token issued");
    Ok(token)
}
