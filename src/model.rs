use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use time::{Duration, OffsetDateTime};

/// Default lifetime of an authenticated session.
pub const DEFAULT_SESSION_LIFETIME_SECS: u32 = 24 * 60 * 60;

/// Opaque bearer token identifying a session; also the `session` cookie value.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrows the underlying token as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short, non-reversible label for logs. The full token is a bearer credential.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.fingerprint())
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identity claims attached to a session and copied into assertions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub user_id: String,
    pub email: String,
    pub username: String,
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expire_time: OffsetDateTime,
    /// Correlation value used as the assertion `SessionIndex`.
    pub index: String,
    pub subject: Subject,
}

impl Session {
    /// Builds a session starting at `now` that lives for `lifetime_secs`.
    pub fn new(
        id: SessionId,
        index: impl Into<String>,
        subject: Subject,
        now: OffsetDateTime,
        lifetime_secs: u32,
    ) -> Self {
        // A zero lifetime would violate expire_time > create_time.
        let lifetime = Duration::seconds(i64::from(lifetime_secs.max(1)));
        Self {
            id,
            create_time: now,
            expire_time: now + lifetime,
            index: index.into(),
            subject,
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expire_time
    }

    /// Seconds until expiry, clamped at zero.
    pub fn remaining_secs(&self, now: OffsetDateTime) -> u64 {
        let left = (self.expire_time - now).whole_seconds();
        u64::try_from(left).unwrap_or(0)
    }
}

/// A trusted service provider, keyed by its entity id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProvider {
    pub name: String,
    /// The SP's SAML metadata document, stored verbatim.
    pub metadata: String,
}

impl ServiceProvider {
    pub fn new(name: impl Into<String>, metadata: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: metadata.into(),
        }
    }
}
