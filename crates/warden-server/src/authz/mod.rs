//! Authorization: role graph, role administration and the decision engine.

use warden_common::{
    Result, WardenError,
    permissions::{Action, Resource},
};

use crate::auth::{AuthSession, PeerInfo};
use crate::config::AuthConfig;
use crate::storage::Snapshot;

pub mod role_graph;
pub mod roles;

pub use role_graph::{RoleDocument, RoleGraph, RoleNode};
pub use roles::RoleStore;

/// Actions the localhost exception permits before the first user exists.
const LOCALHOST_EXCEPTION_ACTIONS: [Action; 3] =
    [Action::CreateUser, Action::CreateRole, Action::GrantRole];

/// Decides whether a session may perform an action on a resource.
///
/// Deny unless some authenticated principal's effective privileges match.
#[derive(Debug, Clone)]
pub struct AuthorizationEngine {
    enabled: bool,
    localhost_exception: bool,
}

impl AuthorizationEngine {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
            localhost_exception: config.localhost_exception,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a local connection may bootstrap the first user.
    pub fn localhost_exception_applies(&self, snapshot: &Snapshot, peer: &PeerInfo) -> bool {
        self.enabled && self.localhost_exception && peer.is_localhost && !snapshot.has_users()
    }

    pub fn authorize(
        &self,
        session: &mut AuthSession,
        snapshot: &Snapshot,
        peer: &PeerInfo,
        resource: &Resource,
        action: Action,
    ) -> Result<()> {
        self.authorize_all(session, snapshot, peer, &[(resource.clone(), action)], action.as_str())
    }

    /// Authorize every `(resource, action)` pair a command declares.
    pub fn authorize_all(
        &self,
        session: &mut AuthSession,
        snapshot: &Snapshot,
        peer: &PeerInfo,
        required: &[(Resource, Action)],
        command: &str,
    ) -> Result<()> {
        session.ensure_open()?;
        if !self.enabled || required.is_empty() {
            return Ok(());
        }

        if self.localhost_exception_applies(snapshot, peer)
            && required
                .iter()
                .all(|(_, action)| LOCALHOST_EXCEPTION_ACTIONS.contains(action))
        {
            tracing::debug!(session = session.id, command, "Allowed by localhost exception");
            return Ok(());
        }

        let privileges = session.effective_privileges(&snapshot.roles);
        for (resource, action) in required {
            let allowed = privileges.iter().any(|set| set.allows(resource, *action));
            if !allowed {
                tracing::debug!(
                    session = session.id,
                    command,
                    %resource,
                    %action,
                    "Authorization denied"
                );
                return Err(WardenError::Unauthorized(format!(
                    "not authorized on {} to execute command {command}",
                    target_db(resource)
                )));
            }
        }
        Ok(())
    }
}

fn target_db(resource: &Resource) -> &str {
    match resource {
        Resource::Cluster => warden_common::ADMIN_DB,
        Resource::Database(db) => db,
        Resource::Collection { db, .. } => db,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        AuthRequest, AuthManager, DigestPolicy, SameDatabaseLogin, Secret,
    };
    use crate::storage::StorageEngine;
    use warden_common::{RoleName, UserName, codes};

    fn config(enabled: bool) -> AuthConfig {
        AuthConfig {
            enabled,
            ..Default::default()
        }
    }

    fn with_user(auth: &AuthManager, roles: Vec<RoleName>) -> StorageEngine {
        let engine = StorageEngine::in_memory();
        let writes = auth
            .credentials()
            .create_credential(
                &engine.snapshot(),
                &UserName::new("spencer", "test"),
                Secret::Password("pwd".into()),
                DigestPolicy::Server,
                roles,
            )
            .unwrap();
        engine.begin_write().commit(1, writes).unwrap();
        engine
    }

    #[test]
    fn test_default_deny() {
        let cfg = config(true);
        let engine = StorageEngine::in_memory();
        let authz = AuthorizationEngine::new(&cfg);
        let mut session = AuthSession::new(SameDatabaseLogin::Reject);

        let err = authz
            .authorize(
                &mut session,
                &engine.snapshot(),
                &PeerInfo::remote(),
                &Resource::database("test"),
                Action::DbStats,
            )
            .unwrap_err();
        assert_eq!(err.code(), codes::UNAUTHORIZED);
    }

    #[test]
    fn test_auth_disabled_allows_everything() {
        let cfg = config(false);
        let engine = StorageEngine::in_memory();
        let authz = AuthorizationEngine::new(&cfg);
        let mut session = AuthSession::new(SameDatabaseLogin::Reject);
        assert!(
            authz
                .authorize(
                    &mut session,
                    &engine.snapshot(),
                    &PeerInfo::remote(),
                    &Resource::Cluster,
                    Action::Shutdown,
                )
                .is_ok()
        );
    }

    #[test]
    fn test_localhost_exception_until_first_user() {
        let cfg = config(true);
        let authz = AuthorizationEngine::new(&cfg);
        let auth = AuthManager::new(&cfg).unwrap();
        let mut session = AuthSession::new(SameDatabaseLogin::Reject);
        let local = PeerInfo::localhost();
        let create_user = [
            (Resource::database("admin"), Action::CreateUser),
            (Resource::database("admin"), Action::GrantRole),
        ];

        let empty = StorageEngine::in_memory();
        authz
            .authorize_all(&mut session, &empty.snapshot(), &local, &create_user, "createUser")
            .unwrap();
        // Not for remote peers, and not for anything else
        assert!(
            authz
                .authorize_all(
                    &mut session,
                    &empty.snapshot(),
                    &PeerInfo::remote(),
                    &create_user,
                    "createUser",
                )
                .is_err()
        );
        assert!(
            authz
                .authorize(
                    &mut session,
                    &empty.snapshot(),
                    &local,
                    &Resource::database("test"),
                    Action::Find,
                )
                .is_err()
        );

        let populated = with_user(&auth, vec![]);
        let err = authz
            .authorize_all(&mut session, &populated.snapshot(), &local, &create_user, "createUser")
            .unwrap_err();
        assert_eq!(err.code(), codes::UNAUTHORIZED);
    }

    #[test]
    fn test_authenticated_principal_privileges() {
        let cfg = config(true);
        let authz = AuthorizationEngine::new(&cfg);
        let auth = AuthManager::new(&cfg).unwrap();
        let engine = with_user(&auth, vec![RoleName::new("read", "test")]);
        let snapshot = engine.snapshot();
        let peer = PeerInfo::remote();

        let mut session = AuthSession::new(SameDatabaseLogin::Reject);
        session
            .authenticate(&auth, &snapshot, &AuthRequest::password("test", "spencer", "pwd"), &peer)
            .unwrap();

        let foo = Resource::collection("test", "foo");
        assert!(authz.authorize(&mut session, &snapshot, &peer, &foo, Action::Find).is_ok());
        assert!(authz.authorize(&mut session, &snapshot, &peer, &foo, Action::Insert).is_err());

        session.logout("test").unwrap();
        assert!(authz.authorize(&mut session, &snapshot, &peer, &foo, Action::Find).is_err());
    }

    #[test]
    fn test_closed_session_is_rejected() {
        let cfg = config(false);
        let engine = StorageEngine::in_memory();
        let authz = AuthorizationEngine::new(&cfg);
        let mut session = AuthSession::new(SameDatabaseLogin::Reject);
        session.close();
        let err = authz
            .authorize(
                &mut session,
                &engine.snapshot(),
                &PeerInfo::remote(),
                &Resource::Cluster,
                Action::Find,
            )
            .unwrap_err();
        assert_eq!(err, WardenError::ConnectionClosed);
    }
}
