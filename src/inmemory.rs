use crate::error::{expired, internal, not_found, IdpResult};
use crate::model::{ServiceProvider, Session, SessionId};
use crate::store::{ServiceProviderRegistry, SessionStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use time::OffsetDateTime;

/// In-memory session store backed by a concurrent hash map.
///
/// Expiry is checked on every read; expired entries stay until deleted or purged.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    /// Number of stored sessions, expired ones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn add(&self, session: Session) -> IdpResult<()> {
        let key = session.id.clone();
        match self.sessions.entry(key) {
            Entry::Occupied(occ) => Err(internal(format!(
                "session id collision ({})",
                occ.key().fingerprint()
            ))),
            Entry::Vacant(vac) => {
                vac.insert(session);
                Ok(())
            }
        }
    }

    fn get_by_cookie(&self, id: &SessionId) -> IdpResult<Session> {
        let now = Self::now();
        let Some(session) = self.sessions.get(id) else {
            return Err(not_found("session not found"));
        };
        if session.is_expired(now) {
            return Err(expired("session has expired"));
        }
        Ok(session.clone())
    }

    fn delete(&self, id: &SessionId) -> IdpResult<()> {
        match self.sessions.remove(id) {
            Some(_) => Ok(()),
            None => Err(not_found("session not found")),
        }
    }

    fn list_all(&self) -> IdpResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if sessions.is_empty() {
            return Err(not_found("no sessions found"));
        }
        sessions.sort_by(|a, b| a.create_time.cmp(&b.create_time));
        Ok(sessions)
    }

    fn purge_expired(&self) -> IdpResult<usize> {
        let now = Self::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        Ok(before.saturating_sub(self.sessions.len()))
    }
}

/// In-memory service provider registry.
#[derive(Default)]
pub struct InMemoryServiceRegistry {
    services: DashMap<String, ServiceProvider>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceProviderRegistry for InMemoryServiceRegistry {
    fn register(&self, sp: ServiceProvider) -> IdpResult<()> {
        self.services.insert(sp.name.clone(), sp);
        Ok(())
    }

    fn get(&self, name: &str) -> IdpResult<ServiceProvider> {
        self.services
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(format!("service provider {name}")))
    }

    fn delete(&self, name: &str) -> IdpResult<()> {
        match self.services.remove(name) {
            Some(_) => Ok(()),
            None => Err(not_found(format!("service provider {name}"))),
        }
    }

    fn list_all(&self) -> IdpResult<Vec<ServiceProvider>> {
        let mut services: Vec<ServiceProvider> = self
            .services
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if services.is_empty() {
            return Err(not_found("no services found"));
        }
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }
}
