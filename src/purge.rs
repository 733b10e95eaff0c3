//! Background removal of expired sessions.

use crate::store::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Spawns a task that calls [`SessionStore::purge_expired`] every `every`.
///
/// The first pass runs one full interval after start. Abort the handle to stop it.
pub fn spawn_purge_task(
    sessions: Arc<dyn SessionStore>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let store = sessions.clone();
            match tokio::task::spawn_blocking(move || store.purge_expired()).await {
                Ok(Ok(0)) => debug!("session purge: nothing expired"),
                Ok(Ok(removed)) => info!(removed, "purged expired sessions"),
                Ok(Err(err)) => warn!(error = %err, "session purge failed"),
                Err(err) => warn!(error = %err, "session purge task panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemorySessionStore;
    use crate::model::{Session, SessionId, Subject};
    use time::OffsetDateTime;

    fn session(id: &str, lifetime: u32, created: OffsetDateTime) -> Session {
        Session::new(SessionId::from(id), "idx", Subject::default(), created, lifetime)
    }

    #[tokio::test]
    async fn removes_only_expired_sessions() {
        let store = Arc::new(InMemorySessionStore::new());
        let now = OffsetDateTime::now_utc();
        store.add(session("live", 3600, now)).expect("add");
        store
            .add(session("stale", 1, now - time::Duration::hours(1)))
            .expect("add");

        let handle = spawn_purge_task(store.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        assert_eq!(store.len(), 1);
        assert!(store.get_by_cookie(&SessionId::from("live")).is_ok());
    }
}
