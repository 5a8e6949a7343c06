//! Authentication for Warden.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use warden_common::{EXTERNAL_DB, Result, UserName, WardenError};

use crate::config::AuthConfig;
use crate::storage::Snapshot;

pub mod credentials;
pub mod session;
pub mod x509;

pub use credentials::{CredentialStore, Credentials, DigestPolicy, Secret, UserDocument};
pub use session::{AuthSession, AuthenticatedPrincipal, Mechanism, SameDatabaseLogin, SessionState};
pub use x509::{ClusterMembership, DistinguishedName};

/// What the transport knows about the other end of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Connection arrived over loopback
    pub is_localhost: bool,
    /// Subject of the already verified client certificate
    pub certificate_subject: Option<String>,
}

impl PeerInfo {
    pub fn localhost() -> Self {
        Self {
            is_localhost: true,
            certificate_subject: None,
        }
    }

    pub fn remote() -> Self {
        Self::default()
    }

    pub fn with_certificate(mut self, subject: impl Into<String>) -> Self {
        self.certificate_subject = Some(subject.into());
        self
    }
}

/// An authentication attempt.
#[derive(Clone)]
pub struct AuthRequest {
    pub db: String,
    /// Omitted for x.509, where the certificate subject names the principal
    pub user: Option<String>,
    pub mechanism: Mechanism,
    pub password: Option<String>,
}

impl AuthRequest {
    pub fn password(
        db: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            db: db.into(),
            user: Some(user.into()),
            mechanism: Mechanism::Password,
            password: Some(password.into()),
        }
    }

    pub fn external(user: Option<String>) -> Self {
        Self {
            db: EXTERNAL_DB.to_string(),
            user,
            mechanism: Mechanism::External,
            password: None,
        }
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("db", &self.db)
            .field("user", &self.user)
            .field("mechanism", &self.mechanism)
            .finish_non_exhaustive()
    }
}

/// Authentication manager for a node.
pub struct AuthManager {
    credentials: CredentialStore,
}

impl AuthManager {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let membership = ClusterMembership::new(config.cluster_subject.as_deref())?;
        Ok(Self {
            credentials: CredentialStore::new(Arc::new(membership))?,
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Verify an authentication attempt.
    ///
    /// Every failure to prove identity is `AuthenticationFailed`, whatever the
    /// cause. Cluster member subjects are refused with `PolicyViolation`.
    pub fn verify(
        &self,
        snapshot: &Snapshot,
        request: &AuthRequest,
        peer: &PeerInfo,
    ) -> Result<AuthenticatedPrincipal> {
        let result = match request.mechanism {
            Mechanism::Password => self.verify_password(snapshot, request),
            Mechanism::External => self.verify_external(snapshot, request, peer),
        };

        match &result {
            Ok(principal) => tracing::info!(
                principal = %principal.name,
                mechanism = ?request.mechanism,
                "Authenticated"
            ),
            Err(WardenError::PolicyViolation(msg)) => tracing::warn!("{msg}"),
            Err(_) => tracing::info!(
                db = %request.db,
                user = request.user.as_deref().unwrap_or(""),
                "Authentication failed"
            ),
        }
        result
    }

    fn verify_password(
        &self,
        snapshot: &Snapshot,
        request: &AuthRequest,
    ) -> Result<AuthenticatedPrincipal> {
        let (Some(user), Some(password)) = (&request.user, &request.password) else {
            return Err(WardenError::AuthenticationFailed);
        };
        if request.db == EXTERNAL_DB {
            return Err(WardenError::AuthenticationFailed);
        }

        let name = UserName::new(user.as_str(), request.db.as_str());
        let doc = self
            .credentials
            .verify(snapshot, &name, password)
            .ok_or(WardenError::AuthenticationFailed)?;

        Ok(AuthenticatedPrincipal {
            name,
            user_id: doc.user_id,
            mechanism: Mechanism::Password,
            authenticated_at: Instant::now(),
        })
    }

    fn verify_external(
        &self,
        snapshot: &Snapshot,
        request: &AuthRequest,
        peer: &PeerInfo,
    ) -> Result<AuthenticatedPrincipal> {
        if request.db != EXTERNAL_DB {
            return Err(WardenError::AuthenticationFailed);
        }

        let claimed = request
            .user
            .as_deref()
            .or(peer.certificate_subject.as_deref())
            .ok_or(WardenError::AuthenticationFailed)?;

        if self.credentials.membership().is_member(claimed) {
            return Err(WardenError::PolicyViolation(format!(
                "cannot authenticate as cluster member subject {claimed}"
            )));
        }

        let subject = peer
            .certificate_subject
            .as_deref()
            .ok_or(WardenError::AuthenticationFailed)?;
        if !DistinguishedName::same_subject(claimed, subject) {
            return Err(WardenError::AuthenticationFailed);
        }

        let name = UserName::new(subject, EXTERNAL_DB);
        let doc = self
            .credentials
            .get(snapshot, &name)?
            .filter(|doc| doc.credentials.external)
            .ok_or(WardenError::AuthenticationFailed)?;

        Ok(AuthenticatedPrincipal {
            name,
            user_id: doc.user_id,
            mechanism: Mechanism::External,
            authenticated_at: Instant::now(),
        })
    }
}
