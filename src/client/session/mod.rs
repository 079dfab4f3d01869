pub(crate) mod pool;

use std::time::{Duration, Instant};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use uuid::Uuid;

use super::Client;

pub(crate) use pool::ServerSessionPool;

/// A MongoDB client session. This struct represents a logical session used for ordering
/// sequential operations. To create a `ClientSession`, call `start_session` on a
/// [`Client`](crate::Client).
///
/// `ClientSession` instances are not thread safe or fork safe. They can only be used by one
/// thread or process at a time.
#[derive(Debug)]
pub struct ClientSession {
    client: Client,
    server_session: Option<ServerSession>,
    is_implicit: bool,
}

impl ClientSession {
    pub(crate) fn new(server_session: ServerSession, client: Client, is_implicit: bool) -> Self {
        Self {
            client,
            server_session: Some(server_session),
            is_implicit,
        }
    }

    /// The client used to create this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.server_session().id
    }

    /// Whether this session was created implicitly by the driver or explicitly by the user.
    #[cfg(test)]
    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    fn server_session(&self) -> &ServerSession {
        self.server_session
            .as_ref()
            .expect("session accessed after drop")
    }

    /// Whether a network error was encountered while using this session.
    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.server_session().dirty
    }

    /// Mark this session (and the underlying server session) as dirty.
    pub(crate) fn mark_dirty(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.dirty = true;
        }
    }

    /// Updates the date that the underlying server session was last used as part of an operation
    /// sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.last_use = Instant::now();
        }
    }

    /// Gets the current txn_number.
    #[cfg(test)]
    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session().txn_number
    }

    /// Increments the txn_number and returns the new value.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        let session = self
            .server_session
            .as_mut()
            .expect("session accessed after drop");
        session.txn_number += 1;
        session.txn_number
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(server_session) = self.server_session.take() {
            self.client.check_in_server_session(server_session);
        }
    }
}

/// Client side abstraction of a server session. These are pooled and may be associated with
/// multiple `ClientSession`s over the course of their lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session. Dirty sessions are
    /// discarded rather than re-pooled, since the server may not have seen their last use.
    pub(crate) dirty: bool,

    /// A monotonically increasing transaction number for this session. It never decreases and
    /// is never reused across logically distinct operations.
    txn_number: i64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    pub(crate) fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire within the next minute, at which
    /// point the server may have already discarded its state.
    pub(crate) fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(timeout) => timeout,
            None => return false,
        };
        let expiration_date = self.last_use + timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }

    #[cfg(test)]
    pub(crate) fn with_last_use(last_use: Instant) -> Self {
        let mut session = Self::new();
        session.last_use = last_use;
        session
    }
}

#[cfg(test)]
mod tests {
    use bson::{spec::BinarySubtype, Bson};

    use super::ServerSession;
    use crate::{options::ClientOptions, Client};

    #[test]
    fn session_ids_are_uuids() {
        let session = ServerSession::new();
        match session.id.get("id") {
            Some(Bson::Binary(binary)) => {
                assert_eq!(binary.subtype, BinarySubtype::Uuid);
                assert_eq!(binary.bytes.len(), 16);
            }
            other => panic!("expected UUID binary id, got {:?}", other),
        }

        // Ids are random; two sessions never share one.
        assert_ne!(session.id, ServerSession::new().id);
    }

    #[tokio::test]
    async fn txn_numbers_strictly_increase() {
        let client = Client::with_options(ClientOptions::default()).unwrap();
        let mut session = client.start_session().await;

        assert_eq!(session.txn_number(), 0);
        let numbers: Vec<i64> = (0..5)
            .map(|_| session.get_and_increment_txn_number())
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn dropped_session_returns_to_pool() {
        let client = Client::with_options(ClientOptions::default()).unwrap();

        let session = client.start_session().await;
        assert!(!session.is_implicit());
        let id = session.id().clone();
        drop(session);

        // Check-in happens on a background task.
        for _ in 0..50 {
            if client.session_pool_contains(&id).await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(client.session_pool_contains(&id).await);

        // The pooled session is reused, and a dirty session is not.
        let mut session = client.start_session().await;
        assert_eq!(session.id(), &id);
        session.mark_dirty();
        assert!(session.is_dirty());
        drop(session);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!client.session_pool_contains(&id).await);
    }
}
