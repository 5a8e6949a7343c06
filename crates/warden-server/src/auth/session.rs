//! Per-connection authentication state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use warden_common::{Result, UserName, WardenError, permissions::PrivilegeSet};

use super::{AuthManager, AuthRequest, PeerInfo};
use crate::authz::RoleGraph;
use crate::storage::Snapshot;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Behavior when a different principal authenticates on a database that
/// already has one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameDatabaseLogin {
    /// Fail with `AlreadyAuthenticated`.
    #[default]
    Reject,
    /// Log the previous principal out.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mechanism {
    /// Password checked against the stored digest
    Password,
    /// Certificate subject verified by the transport
    External,
}

/// A principal admitted on a session.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    pub name: UserName,
    /// Id of the principal document the session authenticated against
    pub user_id: String,
    pub mechanism: Mechanism,
    pub authenticated_at: Instant,
}

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(Vec<UserName>),
    Closed,
}

#[derive(Debug)]
struct CachedPrivileges {
    generation: u64,
    privileges: Arc<PrivilegeSet>,
}

/// Authentication state of one connection.
///
/// The session remembers who authenticated, never how: no password or
/// digest is kept, so nothing can be replayed after a reconnect.
#[derive(Debug)]
pub struct AuthSession {
    pub id: u64,
    pub created_at: Instant,
    policy: SameDatabaseLogin,
    principals: BTreeMap<String, AuthenticatedPrincipal>,
    cache: HashMap<UserName, CachedPrivileges>,
    closed: bool,
}

impl AuthSession {
    pub fn new(policy: SameDatabaseLogin) -> Self {
        Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::SeqCst),
            created_at: Instant::now(),
            policy,
            principals: BTreeMap::new(),
            cache: HashMap::new(),
            closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.principals.is_empty() {
            SessionState::Unauthenticated
        } else {
            SessionState::Authenticated(self.principals.values().map(|p| p.name.clone()).collect())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_authenticated(&self) -> bool {
        !self.closed && !self.principals.is_empty()
    }

    pub fn principals(&self) -> impl Iterator<Item = &AuthenticatedPrincipal> {
        self.principals.values()
    }

    pub fn principal(&self, db: &str) -> Option<&AuthenticatedPrincipal> {
        self.principals.get(db)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(WardenError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Verify `request` and admit the principal.
    ///
    /// On failure the session is left exactly as it was.
    pub fn authenticate(
        &mut self,
        auth: &AuthManager,
        snapshot: &Snapshot,
        request: &AuthRequest,
        peer: &PeerInfo,
    ) -> Result<UserName> {
        self.ensure_open()?;
        let principal = auth.verify(snapshot, request, peer)?;
        let name = principal.name.clone();
        self.admit(principal)?;
        Ok(name)
    }

    /// Add a verified principal, applying the same-database policy.
    pub fn admit(&mut self, principal: AuthenticatedPrincipal) -> Result<()> {
        self.ensure_open()?;
        let db = principal.name.db.clone();

        if let Some(existing) = self.principals.get(&db)
            && existing.name != principal.name
        {
            match self.policy {
                SameDatabaseLogin::Reject => {
                    return Err(WardenError::AlreadyAuthenticated(format!(
                        "already authenticated as {} on database {db}; log out first",
                        existing.name
                    )));
                }
                SameDatabaseLogin::Replace => {
                    tracing::debug!(
                        session = self.id,
                        previous = %existing.name,
                        next = %principal.name,
                        "Replacing principal on database"
                    );
                    let previous = existing.name.clone();
                    self.cache.remove(&previous);
                }
            }
        }

        self.cache.remove(&principal.name);
        self.principals.insert(db, principal);
        Ok(())
    }

    /// Remove the principal authenticated on `db`.
    pub fn logout(&mut self, db: &str) -> Result<Option<UserName>> {
        self.ensure_open()?;
        let removed = self.principals.remove(db).map(|p| p.name);
        if let Some(name) = &removed {
            self.cache.remove(name);
        }
        Ok(removed)
    }

    /// Tear the session down. Terminal.
    pub fn close(&mut self) {
        self.principals.clear();
        self.cache.clear();
        self.closed = true;
    }

    /// Effective privileges of every authenticated principal.
    ///
    /// Resolved sets are cached per principal and reused while the graph
    /// generation is unchanged.
    pub fn effective_privileges(&mut self, graph: &RoleGraph) -> Vec<Arc<PrivilegeSet>> {
        if self.closed {
            return Vec::new();
        }

        let generation = graph.generation();
        let mut resolved = Vec::with_capacity(self.principals.len());
        for principal in self.principals.values() {
            let cached = self
                .cache
                .get(&principal.name)
                .filter(|c| c.generation == generation)
                .map(|c| c.privileges.clone());

            let privileges = match cached {
                Some(privileges) => privileges,
                None => {
                    let privileges = Arc::new(
                        graph.resolve_for_user_id(&principal.name, &principal.user_id),
                    );
                    self.cache.insert(
                        principal.name.clone(),
                        CachedPrivileges {
                            generation,
                            privileges: privileges.clone(),
                        },
                    );
                    privileges
                }
            };
            resolved.push(privileges);
        }
        resolved
    }

    #[cfg(test)]
    pub(crate) fn cached_principals(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::codes;

    fn principal(user: &str, db: &str) -> AuthenticatedPrincipal {
        AuthenticatedPrincipal {
            name: UserName::new(user, db),
            user_id: format!("id-{user}"),
            mechanism: Mechanism::Password,
            authenticated_at: Instant::now(),
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut session = AuthSession::new(SameDatabaseLogin::Reject);
        assert_eq!(session.state(), SessionState::Unauthenticated);

        session.admit(principal("spencer", "test")).unwrap();
        assert_eq!(
            session.state(),
            SessionState::Authenticated(vec![UserName::new("spencer", "test")])
        );

        assert_eq!(
            session.logout("test").unwrap(),
            Some(UserName::new("spencer", "test"))
        );
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert_eq!(session.logout("test").unwrap(), None);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.admit(principal("spencer", "test")).unwrap_err(),
            WardenError::ConnectionClosed
        );
        assert!(session.logout("test").is_err());
    }

    #[test]
    fn test_principals_on_different_databases() {
        let mut session = AuthSession::new(SameDatabaseLogin::Reject);
        session.admit(principal("admin", "admin")).unwrap();
        session.admit(principal("spencer", "test")).unwrap();
        assert_eq!(session.principals().count(), 2);
        assert!(session.principal("admin").is_some());
    }

    #[test]
    fn test_same_database_reject_policy() {
        let mut session = AuthSession::new(SameDatabaseLogin::Reject);
        session.admit(principal("spencer", "test")).unwrap();

        // The same principal again is fine
        session.admit(principal("spencer", "test")).unwrap();

        let err = session.admit(principal("other", "test")).unwrap_err();
        assert_eq!(err.code(), codes::ALREADY_AUTHENTICATED);
        assert_eq!(session.principal("test").unwrap().name.user, "spencer");
    }

    #[test]
    fn test_same_database_replace_policy() {
        let mut session = AuthSession::new(SameDatabaseLogin::Replace);
        session.admit(principal("spencer", "test")).unwrap();
        session.admit(principal("other", "test")).unwrap();
        assert_eq!(session.principals().count(), 1);
        assert_eq!(session.principal("test").unwrap().name.user, "other");
    }

    #[test]
    fn test_logout_purges_cached_privileges() {
        let graph = RoleGraph::default();
        let mut session = AuthSession::new(SameDatabaseLogin::Reject);
        session.admit(principal("spencer", "test")).unwrap();

        assert_eq!(session.effective_privileges(&graph).len(), 1);
        assert_eq!(session.cached_principals(), 1);

        session.logout("test").unwrap();
        assert_eq!(session.cached_principals(), 0);
        assert!(session.effective_privileges(&graph).is_empty());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = AuthSession::new(SameDatabaseLogin::Reject);
        let b = AuthSession::new(SameDatabaseLogin::Reject);
        assert_ne!(a.id, b.id);
    }
}
