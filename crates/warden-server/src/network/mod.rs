//! Client connections.
//!
//! A connection owns its authentication session and hands it to the node for
//! every request. Sessions never outlive the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use warden_common::{Result, WardenError};

use crate::auth::{AuthSession, PeerInfo, SessionState};
use crate::commands::{Command, Reply};
use crate::node::Node;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct Connection {
    pub id: u64,
    pub connected_at: Instant,
    node: Arc<Node>,
    peer: PeerInfo,
    session: AuthSession,
}

impl Connection {
    pub fn open(node: Arc<Node>, peer: PeerInfo) -> Self {
        let id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let session = AuthSession::new(node.config().auth.same_database_login);
        node.register_connection(id);

        #[cfg(debug_assertions)]
        tracing::debug!(
            connection = id,
            node = node.name(),
            local = peer.is_localhost,
            "New connection"
        );

        Self {
            id,
            connected_at: Instant::now(),
            node,
            peer,
            session,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Send one command over this connection.
    pub async fn run(&mut self, command: Command) -> Result<Reply> {
        if self.session.is_closed() {
            return Err(WardenError::ConnectionClosed);
        }
        let result = self.node.execute(&mut self.session, &self.peer, command).await;
        if matches!(result, Err(WardenError::ConnectionClosed)) {
            self.close();
        }
        result
    }

    /// Open a new connection to `node` from the same peer.
    ///
    /// The new connection starts unauthenticated; nothing carries over.
    pub fn reconnect(&mut self, node: Arc<Node>) {
        self.close();
        *self = Connection::open(node, self.peer.clone());
    }

    pub fn close(&mut self) {
        if !self.session.is_closed() {
            self.session.close();
            self.node.unregister_connection(self.id);
            tracing::debug!(connection = self.id, "Connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthRequest, DigestPolicy};
    use crate::config::Config;
    use warden_common::RoleName;

    fn node() -> Arc<Node> {
        Arc::new(Node::open(Config::default(), 0).unwrap())
    }

    #[tokio::test]
    async fn test_connections_are_registered() {
        let node = node();
        let mut conn = Connection::open(node.clone(), PeerInfo::remote());
        let other = Connection::open(node.clone(), PeerInfo::remote());
        assert_eq!(node.connection_count(), 2);
        assert_ne!(conn.id, other.id);

        drop(other);
        assert_eq!(node.connection_count(), 1);
        conn.close();
        assert_eq!(node.connection_count(), 0);
        assert_eq!(conn.state(), SessionState::Closed);
        assert_eq!(
            conn.run(Command::IsMaster).await.unwrap_err(),
            WardenError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_reconnect_starts_unauthenticated() {
        let node = node();
        let mut conn = Connection::open(node.clone(), PeerInfo::localhost());
        conn.run(Command::CreateUser {
            db: "admin".into(),
            user: "admin".into(),
            password: Some("pwd".into()),
            digest: DigestPolicy::Server,
            roles: vec![RoleName::new("root", "admin")],
            write_concern: None,
        })
        .await
        .unwrap();
        conn.run(Command::Authenticate(AuthRequest::password("admin", "admin", "pwd")))
            .await
            .unwrap();
        assert!(conn.session().is_authenticated());

        conn.reconnect(node.clone());
        assert_eq!(conn.state(), SessionState::Unauthenticated);
        assert_eq!(node.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_node_shutdown_closes_connection() {
        let node = node();
        let mut conn = Connection::open(node.clone(), PeerInfo::remote());
        node.shutdown();
        assert_eq!(
            conn.run(Command::IsMaster).await.unwrap_err(),
            WardenError::ConnectionClosed
        );
        assert_eq!(conn.state(), SessionState::Closed);
    }
}
