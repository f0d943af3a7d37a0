use constant_time_eq::constant_time_eq;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AuthError;
use crate::store::RecordStore;

// Device tokens look like `<device id>.<secret>`. Only the SHA-256 of the
// secret is stored, so the device id is needed to find the row.

pub fn generate_token(device_id: Uuid) -> (String, String) {
    let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let token = format!("{}.{}", device_id.simple(), secret);
    (token, hash_secret(&secret))
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn parse_token(token: &str) -> Option<(Uuid, &str)> {
    let (device, secret) = token.split_once('.')?;
    if secret.is_empty() {
        return None;
    }
    Some((Uuid::parse_str(device).ok()?, secret))
}

pub fn secret_matches(secret: &str, stored_hash: &str) -> bool {
    constant_time_eq(hash_secret(secret).as_bytes(), stored_hash.as_bytes())
}

/// Resolves a device token to the `(user_id, device_id)` it was issued for.
#[derive(Clone)]
pub struct TokenAuthenticator {
    store: RecordStore,
}

impl TokenAuthenticator {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub async fn verify(&self, token: &str) -> Result<(Uuid, Uuid), AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let (device_id, secret) = parse_token(token).ok_or(AuthError::InvalidToken)?;

        let Some(device) = self.store.get_device(device_id).await? else {
            debug!(device_id = %device_id, "Token presented for unknown device");
            return Err(AuthError::InvalidToken);
        };

        if !secret_matches(secret, &device.token_hash) {
            warn!(device_id = %device_id, "Device token mismatch");
            return Err(AuthError::InvalidToken);
        }

        Ok((device.user_id, device.id))
    }
}

/// Claims of a user credential minted by the account service.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: Uuid,
    pub exp: u64,
}

/// Verifies HS256 user credentials. Issuing them is the account service's
/// job; this side only checks signature and expiry.
#[derive(Clone)]
pub struct UserTokenVerifier {
    key: Option<DecodingKey>,
}

impl UserTokenVerifier {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.map(|secret| DecodingKey::from_secret(secret.as_bytes())),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        let Some(key) = &self.key else {
            debug!("User credential presented but none are accepted");
            return Err(AuthError::InvalidToken);
        };
        let claims = decode::<UserClaims>(token.trim(), key, &Validation::new(Algorithm::HS256))
            .map_err(|e| {
                warn!("User credential rejected: {}", e);
                AuthError::InvalidToken
            })?
            .claims;
        Ok(claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Device;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    fn user_token(secret: &str, user_id: Uuid, lifetime: i64) -> String {
        let exp = OffsetDateTime::now_utc().unix_timestamp() + lifetime;
        encode(
            &Header::default(),
            &UserClaims {
                sub: user_id,
                exp: exp as u64,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_user_credentials() {
        let user_id = Uuid::new_v4();
        let verifier = UserTokenVerifier::new(Some("account-secret"));
        assert_eq!(
            verifier.verify(&user_token("account-secret", user_id, 600)).unwrap(),
            user_id
        );
        assert!(verifier.verify(&user_token("other-secret", user_id, 600)).is_err());
        assert!(verifier.verify(&user_token("account-secret", user_id, -600)).is_err());

        let closed = UserTokenVerifier::new(None);
        assert!(matches!(
            closed.verify(&user_token("account-secret", user_id, 600)),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_token_hashing() {
        let device_id = Uuid::new_v4();
        let (token, hash) = generate_token(device_id);
        let (parsed_id, secret) = parse_token(&token).unwrap();

        assert_eq!(parsed_id, device_id);
        assert!(secret_matches(secret, &hash));
        assert!(!secret_matches("not-the-secret", &hash));
        assert_eq!(hash_secret(secret), hash);

        assert!(parse_token("garbage").is_none());
        assert!(parse_token(&format!("{}.", device_id.simple())).is_none());
    }

    #[tokio::test]
    async fn test_authenticator_verifies_against_store() {
        let store = RecordStore::memory();
        let device_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let (token, token_hash) = generate_token(device_id);
        store
            .insert_device(&Device {
                id: device_id,
                user_id,
                name: "phone".into(),
                platform: "android".into(),
                token_hash,
                created_at: OffsetDateTime::now_utc(),
                last_seen_at: None,
            })
            .await
            .unwrap();

        let auth = TokenAuthenticator::new(store);
        assert_eq!(auth.verify(&token).await.unwrap(), (user_id, device_id));
        assert!(matches!(auth.verify("").await, Err(AuthError::MissingToken)));

        let (forged, _) = generate_token(device_id);
        assert!(matches!(auth.verify(&forged).await, Err(AuthError::InvalidToken)));
    }
}
