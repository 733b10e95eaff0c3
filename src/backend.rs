use crate::error::{config_error, IdpResult};
use crate::inmemory::{InMemoryServiceRegistry, InMemorySessionStore};
use crate::store::{ServiceProviderRegistry, SessionStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Storage backend selected at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "url", rename_all = "kebab-case")]
pub enum StoreBackendConfig {
    #[default]
    InMemory,
    RedisUrl(String),
}

/// The pair of stores the login flow and admin endpoints share.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub services: Arc<dyn ServiceProviderRegistry>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionStore::new()),
            services: Arc::new(InMemoryServiceRegistry::new()),
        }
    }
}

/// Builds the session store and service registry for the configured backend.
pub fn create_stores(config: StoreBackendConfig) -> IdpResult<Stores> {
    match config {
        StoreBackendConfig::InMemory => Ok(Stores::in_memory()),
        StoreBackendConfig::RedisUrl(url) => redis_stores(&url),
    }
}

#[cfg(feature = "redis")]
fn redis_stores(url: &str) -> IdpResult<Stores> {
    use crate::redis_store::{RedisServiceRegistry, RedisSessionStore};

    Ok(Stores {
        sessions: Arc::new(RedisSessionStore::from_url(url)?),
        services: Arc::new(RedisServiceRegistry::from_url(url)?),
    })
}

#[cfg(not(feature = "redis"))]
fn redis_stores(_url: &str) -> IdpResult<Stores> {
    Err(config_error(
        "redis backend requested but the crate was built without the `redis` feature",
    ))
}

impl StoreBackendConfig {
    /// Rejects obviously unusable settings before any connection is attempted.
    pub fn validate(&self) -> IdpResult<()> {
        match self {
            StoreBackendConfig::InMemory => Ok(()),
            StoreBackendConfig::RedisUrl(url) if url.trim().is_empty() => {
                Err(config_error("redis backend requires a non-empty url"))
            }
            StoreBackendConfig::RedisUrl(_) => Ok(()),
        }
    }
}
