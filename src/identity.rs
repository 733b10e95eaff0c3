//! Credential verification against the external user service.

use crate::breaker::{BreakerError, BreakerPolicy, CircuitBreaker};
use crate::token::SystemTokenSigner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// A user as returned by the identity source, checked once at this boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Accounts without the flag are treated as active.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    /// Unknown user, wrong password or inactive account. Callers must not tell these apart.
    #[error("credentials rejected: {0}")]
    Rejected(String),
    /// The identity source could not be asked.
    #[error("identity source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityLookup: Send + Sync + 'static {
    async fn find_user(&self, email: &str, password: &str) -> Result<UserRecord, LookupError>;
}

#[derive(Serialize)]
struct FindUserRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Looks users up with `POST <user service>/find`, authenticated by a system JWT and guarded by
/// a circuit breaker.
pub struct HttpIdentityLookup {
    client: reqwest::Client,
    find_url: String,
    signer: SystemTokenSigner,
    breaker: CircuitBreaker,
}

impl HttpIdentityLookup {
    pub fn new(
        user_service_url: &str,
        signer: SystemTokenSigner,
        policy: BreakerPolicy,
    ) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(policy.timeout_ms.saturating_mul(2)))
            .build()
            .map_err(|err| LookupError::Unavailable(format!("http client: {err}")))?;
        Ok(Self {
            client,
            find_url: format!("{}/find", user_service_url.trim_end_matches('/')),
            signer,
            breaker: CircuitBreaker::new("user-microservice.find_by_email", policy),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl IdentityLookup for HttpIdentityLookup {
    async fn find_user(&self, email: &str, password: &str) -> Result<UserRecord, LookupError> {
        let token = self
            .signer
            .sign(OffsetDateTime::now_utc())
            .map_err(|err| LookupError::Unavailable(err.to_string()))?;
        let body = FindUserRequest { email, password };

        let response = self
            .breaker
            .call(|| {
                self.client
                    .post(&self.find_url)
                    .bearer_auth(&token)
                    .json(&body)
                    .send()
            })
            .await
            .map_err(|err| {
                let reason = match err {
                    BreakerError::Inner(err) => err.to_string(),
                    other => other.to_string(),
                };
                warn!(url = %self.find_url, %reason, "user lookup failed");
                LookupError::Unavailable(reason)
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            debug!(%status, "user service rejected credentials");
            return Err(LookupError::Rejected(format!("user service returned {status}")));
        }
        let user: UserRecord = response
            .json()
            .await
            .map_err(|err| LookupError::Unavailable(format!("malformed user record: {err}")))?;
        if !user.active {
            return Err(LookupError::Rejected("account-not-activated".to_string()));
        }
        Ok(user)
    }
}
