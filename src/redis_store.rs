use crate::error::{expired, internal, not_found, redis_error, serde_error, IdpResult};
use crate::model::{ServiceProvider, Session, SessionId};
use crate::store::{ServiceProviderRegistry, SessionStore};
use redis::{Client, Commands, Connection, Script};
use time::OffsetDateTime;
use tracing::debug;

const DEFAULT_NAMESPACE: &str = "saml-idp";

/// Writes the session key and its index entry in one step; returns 0 on an id collision.
const ADD_SESSION: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    redis.call('SADD', KEYS[2], ARGV[3])
    return 1
end
return 0
"#;

/// Redis-backed session store that mirrors the in-memory semantics.
///
/// Each session key carries a Redis TTL equal to its remaining lifetime plus an optional
/// retention window, so Redis evicts sessions on the same clock the read path checks.
pub struct RedisSessionStore {
    client: Client,
    namespace: String,
    expired_retention_secs: u64,
}

impl RedisSessionStore {
    /// Creates a store using a Redis URL and the default namespace prefix.
    pub fn from_url(url: impl AsRef<str>) -> IdpResult<Self> {
        let client = Client::open(url.as_ref()).map_err(redis_error)?;
        Ok(Self::with_namespace(client, DEFAULT_NAMESPACE))
    }

    /// Creates a store with a custom namespace prefix.
    pub fn with_namespace(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            expired_retention_secs: 0,
        }
    }

    /// Keeps expired sessions readable (as `Expired`) for `secs` before Redis drops them.
    pub fn with_expired_retention(mut self, secs: u64) -> Self {
        self.expired_retention_secs = secs;
        self
    }

    fn conn(&self) -> IdpResult<Connection> {
        self.client.get_connection().map_err(redis_error)
    }

    fn session_entry_key(&self, id: &SessionId) -> String {
        format!("{}:session:{}", self.namespace, id.as_str())
    }

    fn index_key(&self) -> String {
        format!("{}:sessions", self.namespace)
    }

    fn serialize(session: &Session) -> IdpResult<String> {
        serde_json::to_string(session).map_err(serde_error)
    }

    fn deserialize(payload: &str) -> IdpResult<Session> {
        serde_json::from_str(payload).map_err(serde_error)
    }

    fn ttl_for(&self, session: &Session, now: OffsetDateTime) -> u64 {
        (session.remaining_secs(now) + self.expired_retention_secs).max(1)
    }

    /// Loads every indexed session, pruning index entries whose key Redis already evicted.
    fn load_indexed(&self, conn: &mut Connection) -> IdpResult<Vec<Session>> {
        let index_key = self.index_key();
        let members: Vec<String> = conn.smembers(&index_key).map_err(redis_error)?;
        let mut sessions = Vec::with_capacity(members.len());
        for raw_id in members {
            let id = SessionId::new(raw_id.clone());
            let payload: Option<String> =
                conn.get(self.session_entry_key(&id)).map_err(redis_error)?;
            match payload {
                Some(payload) => sessions.push(Self::deserialize(&payload)?),
                None => {
                    let _: () = conn.srem(&index_key, raw_id).map_err(redis_error)?;
                }
            }
        }
        Ok(sessions)
    }
}

impl SessionStore for RedisSessionStore {
    fn add(&self, session: Session) -> IdpResult<()> {
        let now = OffsetDateTime::now_utc();
        let payload = Self::serialize(&session)?;
        let entry_key = self.session_entry_key(&session.id);
        let mut conn = self.conn()?;
        let stored: i64 = Script::new(ADD_SESSION)
            .key(&entry_key)
            .key(self.index_key())
            .arg(payload)
            .arg(self.ttl_for(&session, now))
            .arg(session.id.as_str())
            .invoke(&mut conn)
            .map_err(redis_error)?;
        if stored == 0 {
            return Err(internal(format!(
                "session id collision ({})",
                session.id.fingerprint()
            )));
        }
        Ok(())
    }

    fn get_by_cookie(&self, id: &SessionId) -> IdpResult<Session> {
        let mut conn = self.conn()?;
        let payload: Option<String> = conn.get(self.session_entry_key(id)).map_err(redis_error)?;
        let Some(payload) = payload else {
            return Err(not_found("session not found"));
        };
        let session = Self::deserialize(&payload)?;
        if session.is_expired(OffsetDateTime::now_utc()) {
            return Err(expired("session has expired"));
        }
        Ok(session)
    }

    fn delete(&self, id: &SessionId) -> IdpResult<()> {
        let mut conn = self.conn()?;
        let removed: u64 = conn.del(self.session_entry_key(id)).map_err(redis_error)?;
        let _: () = conn
            .srem(self.index_key(), id.as_str())
            .map_err(redis_error)?;
        if removed == 0 {
            return Err(not_found("session not found"));
        }
        Ok(())
    }

    fn list_all(&self) -> IdpResult<Vec<Session>> {
        let mut conn = self.conn()?;
        let mut sessions = self.load_indexed(&mut conn)?;
        if sessions.is_empty() {
            return Err(not_found("no sessions found"));
        }
        sessions.sort_by(|a, b| a.create_time.cmp(&b.create_time));
        Ok(sessions)
    }

    fn purge_expired(&self) -> IdpResult<usize> {
        let now = OffsetDateTime::now_utc();
        let mut conn = self.conn()?;
        let mut purged = 0;
        for session in self.load_indexed(&mut conn)? {
            if session.is_expired(now) {
                let _: () = conn
                    .del(self.session_entry_key(&session.id))
                    .map_err(redis_error)?;
                let _: () = conn
                    .srem(self.index_key(), session.id.as_str())
                    .map_err(redis_error)?;
                purged += 1;
            }
        }
        debug!(purged, namespace = %self.namespace, "purged expired redis sessions");
        Ok(purged)
    }
}

/// Redis-backed service provider registry.
pub struct RedisServiceRegistry {
    client: Client,
    namespace: String,
}

impl RedisServiceRegistry {
    pub fn from_url(url: impl AsRef<str>) -> IdpResult<Self> {
        let client = Client::open(url.as_ref()).map_err(redis_error)?;
        Ok(Self::with_namespace(client, DEFAULT_NAMESPACE))
    }

    pub fn with_namespace(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn conn(&self) -> IdpResult<Connection> {
        self.client.get_connection().map_err(redis_error)
    }

    fn service_entry_key(&self, name: &str) -> String {
        format!("{}:service:{}", self.namespace, name)
    }

    fn index_key(&self) -> String {
        format!("{}:services", self.namespace)
    }
}

impl ServiceProviderRegistry for RedisServiceRegistry {
    fn register(&self, sp: ServiceProvider) -> IdpResult<()> {
        let payload = serde_json::to_string(&sp).map_err(serde_error)?;
        let mut conn = self.conn()?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.service_entry_key(&sp.name), payload)
            .ignore()
            .sadd(self.index_key(), &sp.name)
            .ignore()
            .query(&mut conn)
            .map_err(redis_error)?;
        Ok(())
    }

    fn get(&self, name: &str) -> IdpResult<ServiceProvider> {
        let mut conn = self.conn()?;
        let payload: Option<String> = conn
            .get(self.service_entry_key(name))
            .map_err(redis_error)?;
        let Some(payload) = payload else {
            return Err(not_found(format!("service provider {name}")));
        };
        serde_json::from_str(&payload).map_err(serde_error)
    }

    fn delete(&self, name: &str) -> IdpResult<()> {
        let mut conn = self.conn()?;
        let removed: u64 = conn.del(self.service_entry_key(name)).map_err(redis_error)?;
        let _: () = conn.srem(self.index_key(), name).map_err(redis_error)?;
        if removed == 0 {
            return Err(not_found(format!("service provider {name}")));
        }
        Ok(())
    }

    fn list_all(&self) -> IdpResult<Vec<ServiceProvider>> {
        let mut conn = self.conn()?;
        let names: Vec<String> = conn.smembers(self.index_key()).map_err(redis_error)?;
        let mut services = Vec::with_capacity(names.len());
        for name in names {
            let payload: Option<String> = conn
                .get(self.service_entry_key(&name))
                .map_err(redis_error)?;
            if let Some(payload) = payload {
                services.push(serde_json::from_str(&payload).map_err(serde_error)?);
            }
        }
        if services.is_empty() {
            return Err(not_found("no services found"));
        }
        services.sort_by(|a: &ServiceProvider, b: &ServiceProvider| a.name.cmp(&b.name));
        Ok(services)
    }
}
