#![forbid(unsafe_code)]

pub mod backend;
pub mod breaker;
pub mod config;
pub mod error;
pub mod flow;
pub mod http;
pub mod identity;
pub mod inmemory;
pub mod model;
pub mod purge;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod saml;
pub mod store;
pub mod token;

pub use backend::{create_stores, StoreBackendConfig, Stores};
pub use config::IdpConfig;
pub use error::{ErrorKind, IdpError, IdpResult};
pub use flow::{FlowSettings, LoginFlow};
pub use http::{router, AppState};
pub use identity::{HttpIdentityLookup, IdentityLookup, UserRecord};
pub use model::{ServiceProvider, Session, SessionId, Subject};
pub use purge::spawn_purge_task;
pub use store::{ServiceProviderRegistry, SessionStore};
