use std::{collections::VecDeque, time::Duration};

use bson::Document;
use tokio::sync::Mutex;

use super::ServerSession;

/// A FIFO cache of server sessions. Sessions near expiry are discarded on the way in and on the
/// way out, so a checked-out session is always usable for at least a minute.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session from the pool. Expired sessions are discarded until a live
    /// one is found; if none is, a new session is created.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session to the pool. If it is about to expire or is dirty, it will be
    /// discarded.
    ///
    /// This method also clears expired sessions from the back of the pool before checking in.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    /// Drains the pool, returning the ids of every pooled session so they can be ended on the
    /// deployment at shutdown.
    pub(crate) async fn drain(&self) -> Vec<Document> {
        self.pool
            .lock()
            .await
            .drain(..)
            .map(|session| session.id)
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    const THIRTY_MINUTES: Option<Duration> = Some(Duration::from_secs(30 * 60));

    #[tokio::test]
    async fn expired_session_is_not_reused() {
        let pool = ServerSessionPool::new();

        // A session last used 30 minutes ago is already past a 30 minute logical session
        // timeout.
        let expired =
            ServerSession::with_last_use(Instant::now() - Duration::from_secs(1800));
        let expired_id = expired.id.clone();
        pool.check_in(expired, THIRTY_MINUTES).await;

        let fresh = pool.check_out(THIRTY_MINUTES).await;
        assert_ne!(fresh.id, expired_id);
    }

    #[tokio::test]
    async fn session_within_a_minute_of_expiry_is_discarded() {
        let pool = ServerSessionPool::new();

        let about_to_expire =
            ServerSession::with_last_use(Instant::now() - Duration::from_secs(30 * 60 - 30));
        let id = about_to_expire.id.clone();
        pool.check_in(about_to_expire, THIRTY_MINUTES).await;
        assert!(!pool.contains(&id).await);
    }

    #[tokio::test]
    async fn checkout_is_fifo_from_most_recently_used() {
        let pool = ServerSessionPool::new();

        let first = ServerSession::new();
        let second = ServerSession::new();
        let (first_id, second_id) = (first.id.clone(), second.id.clone());

        pool.check_in(first, THIRTY_MINUTES).await;
        pool.check_in(second, THIRTY_MINUTES).await;

        // The most recently checked-in session comes out first, keeping the working set small
        // so idle sessions age out.
        assert_eq!(pool.check_out(THIRTY_MINUTES).await.id, second_id);
        assert_eq!(pool.check_out(THIRTY_MINUTES).await.id, first_id);
    }

    #[tokio::test]
    async fn dirty_session_is_not_pooled() {
        let pool = ServerSessionPool::new();

        let mut session = ServerSession::new();
        session.dirty = true;
        let id = session.id.clone();
        pool.check_in(session, THIRTY_MINUTES).await;
        assert!(!pool.contains(&id).await);
    }
}
