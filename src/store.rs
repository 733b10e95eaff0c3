use crate::error::IdpResult;
use crate::model::{ServiceProvider, Session, SessionId};

/// Durable storage for authenticated sessions.
///
/// Implementations translate their own failures into [`crate::IdpError`] before returning, and
/// every call is atomic: a session is either fully visible or absent.
pub trait SessionStore: Send + Sync + 'static {
    /// Inserts a new session. An existing session with the same id is an internal error.
    fn add(&self, session: Session) -> IdpResult<()>;

    /// Fetches the session stored under `id`.
    ///
    /// Returns `Expired` when the session exists but its window has passed. The record is left
    /// in place; purging is a separate concern.
    fn get_by_cookie(&self, id: &SessionId) -> IdpResult<Session>;

    /// Removes the session, failing with `NotFound` when absent.
    fn delete(&self, id: &SessionId) -> IdpResult<()>;

    /// Lists every stored session, expired ones included. An empty store is `NotFound`.
    fn list_all(&self) -> IdpResult<Vec<Session>>;

    /// Drops sessions whose window has passed and returns how many were removed.
    fn purge_expired(&self) -> IdpResult<usize>;
}

/// Durable storage for trusted service providers.
pub trait ServiceProviderRegistry: Send + Sync + 'static {
    /// Inserts the provider or replaces the one registered under the same name.
    fn register(&self, sp: ServiceProvider) -> IdpResult<()>;

    /// Exact-match lookup by entity id.
    fn get(&self, name: &str) -> IdpResult<ServiceProvider>;

    fn delete(&self, name: &str) -> IdpResult<()>;

    /// Lists every registered provider. An empty registry is `NotFound`.
    fn list_all(&self) -> IdpResult<Vec<ServiceProvider>>;
}
