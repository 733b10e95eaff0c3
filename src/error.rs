use thiserror::Error;

pub type IdpResult<T> = Result<T, IdpError>;

/// Coarse error category used to pick an HTTP status or a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Expired,
    InvalidRequest,
    Internal,
    Config,
}

/// Errors surfaced by the stores, the SAML pipeline and the login flow.
///
/// Backend failures (Redis, serde, OpenSSL) are translated into this taxonomy at the point
/// where they occur, so callers never match on driver error types.
#[derive(Debug, Error)]
pub enum IdpError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Startup only: configuration or signing material could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IdpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdpError::NotFound(_) => ErrorKind::NotFound,
            IdpError::Expired(_) => ErrorKind::Expired,
            IdpError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            IdpError::Internal(_) => ErrorKind::Internal,
            IdpError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            IdpError::NotFound(msg)
            | IdpError::Expired(msg)
            | IdpError::InvalidRequest(msg)
            | IdpError::Internal(msg)
            | IdpError::Config(msg) => msg,
        }
    }
}

pub fn not_found(what: impl Into<String>) -> IdpError {
    IdpError::NotFound(what.into())
}

pub fn expired(what: impl Into<String>) -> IdpError {
    IdpError::Expired(what.into())
}

pub fn invalid_request(msg: impl Into<String>) -> IdpError {
    IdpError::InvalidRequest(msg.into())
}

pub fn internal(msg: impl Into<String>) -> IdpError {
    IdpError::Internal(msg.into())
}

pub fn config_error(msg: impl Into<String>) -> IdpError {
    IdpError::Config(msg.into())
}

pub(crate) fn serde_error(err: serde_json::Error) -> IdpError {
    IdpError::Internal(err.to_string())
}

#[cfg(feature = "redis")]
pub(crate) fn redis_error(err: redis::RedisError) -> IdpError {
    IdpError::Internal(format!("redis: {err}"))
}

pub(crate) fn openssl_error(err: openssl::error::ErrorStack) -> IdpError {
    IdpError::Internal(format!("openssl: {err}"))
}
