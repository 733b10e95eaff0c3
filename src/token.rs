//! Session identifiers and the system token presented to the user service.

use crate::error::{config_error, internal, openssl_error, IdpResult};
use crate::model::SessionId;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

const SYSTEM_ISSUER: &str = "identity-provider";
const SYSTEM_TOKEN_TTL_SECS: i64 = 30;

/// Claims carried by a session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    /// Keeps two logins of the same user from minting the same id.
    pub jti: String,
}

/// Mints HS256 session tokens.
pub struct SessionTokenMinter {
    key: EncodingKey,
}

impl SessionTokenMinter {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
        }
    }

    pub fn mint(
        &self,
        user_id: &str,
        username: &str,
        email: &str,
        roles: &[String],
    ) -> IdpResult<SessionId> {
        let claims = SessionClaims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            email: email.to_string(),
            roles: roles.to_vec(),
            jti: Uuid::new_v4().to_string(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|err| internal(format!("minting session token: {err}")))?;
        Ok(SessionId::new(token))
    }
}

/// Hex of 32 random bytes; the assertion `SessionIndex`.
pub fn session_index() -> IdpResult<String> {
    let mut bytes = [0u8; 32];
    openssl::rand::rand_bytes(&mut bytes).map_err(openssl_error)?;
    Ok(hex::encode(bytes))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemClaims {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    pub nbf: i64,
    pub jti: String,
    pub scope: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub username: String,
    pub roles: String,
}

/// Signs short-lived RS256 tokens that authenticate this service to the user service.
pub struct SystemTokenSigner {
    key: EncodingKey,
}

impl SystemTokenSigner {
    pub fn from_rsa_pem(pem: &[u8]) -> IdpResult<Self> {
        let key = EncodingKey::from_rsa_pem(pem)
            .map_err(|err| config_error(format!("system key: {err}")))?;
        Ok(Self { key })
    }

    pub fn sign(&self, now: OffsetDateTime) -> IdpResult<String> {
        let claims = SystemClaims {
            iss: SYSTEM_ISSUER.to_string(),
            sub: SYSTEM_ISSUER.to_string(),
            exp: now.unix_timestamp() + SYSTEM_TOKEN_TTL_SECS,
            nbf: 0,
            jti: Uuid::new_v4().to_string(),
            scope: "api:read".to_string(),
            user_id: "system".to_string(),
            username: "system".to_string(),
            roles: "system".to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|err| internal(format!("signing system token: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::SigningCredentials;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use proptest::prelude::*;

    #[test]
    fn session_tokens_decode_with_the_same_secret() {
        let minter = SessionTokenMinter::new(b"secret");
        let id = minter
            .mint("u-1", "jane", "jane@example.com", &["admin".to_string()])
            .expect("mint");
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let data = decode::<SessionClaims>(
            id.as_str(),
            &DecodingKey::from_secret(b"secret"),
            &validation,
        )
        .expect("decode");
        assert_eq!(data.claims.user_id, "u-1");
        assert_eq!(data.claims.roles, vec!["admin".to_string()]);
    }

    #[test]
    fn session_index_is_64_hex_chars() {
        let index = session_index().expect("index");
        assert_eq!(index.len(), 64);
        assert!(index.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(index, session_index().expect("index"));
    }

    #[test]
    fn system_token_verifies_with_public_key() {
        let creds = SigningCredentials::generate_self_signed("system").expect("creds");
        let signer =
            SystemTokenSigner::from_rsa_pem(&creds.private_key_pem().expect("pem")).expect("signer");
        let token = signer.sign(OffsetDateTime::now_utc()).expect("sign");
        let key = DecodingKey::from_rsa_pem(&creds.public_key_pem().expect("pub")).expect("key");
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[SYSTEM_ISSUER]);
        let data = decode::<SystemClaims>(&token, &key, &validation).expect("decode");
        assert_eq!(data.claims.scope, "api:read");
        assert_eq!(data.claims.sub, "identity-provider");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn repeated_logins_never_share_an_id(
            user in "[a-z0-9]{1,12}",
            email in "[a-z]{1,8}@[a-z]{1,8}\\.com",
            roles in proptest::collection::vec("[a-z]{1,6}", 0..4),
        ) {
            let minter = SessionTokenMinter::new(b"k");
            let a = minter.mint(&user, &user, &email, &roles).expect("mint");
            let b = minter.mint(&user, &user, &email, &roles).expect("mint");
            prop_assert_ne!(a, b);
        }
    }
}
