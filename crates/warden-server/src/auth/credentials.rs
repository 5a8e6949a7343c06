//! Principal documents and password hashing.
//!
//! Principals live in `admin.system.users`. Mutating operations validate
//! against a snapshot and return the document writes to commit; the node's
//! write path turns them into one replicated log entry.

use std::fmt;
use std::sync::Arc;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use warden_common::{Result, RoleName, UserName, WardenError};

use super::x509::ClusterMembership;
use crate::storage::{DocWrite, Snapshot, USERS_NS, from_document, to_document};

/// A principal as stored in the users collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDocument {
    /// `<db>.<user>`
    #[serde(rename = "_id")]
    pub id: String,
    /// Unique per creation; a re-created principal gets a new one
    pub user_id: String,
    pub user: String,
    pub db: String,
    pub credentials: Credentials,
    #[serde(default)]
    pub roles: Vec<RoleName>,
    /// Unix timestamp when user was created
    #[serde(default)]
    pub created_at: i64,
    /// Unix timestamp when user was last updated
    #[serde(default)]
    pub updated_at: i64,
}

impl UserDocument {
    pub fn name(&self) -> UserName {
        UserName::new(&self.user, &self.db)
    }

    fn touch(&mut self) {
        self.updated_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);
    }
}

/// Verification material. Exactly one of the fields is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Argon2id digest in PHC format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argon2id: Option<String>,
    /// Identity is proven outside the server
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
}

/// Secret supplied when creating or updating a principal.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    External,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(<redacted>)"),
            Secret::External => f.write_str("External"),
        }
    }
}

/// Who derives the stored digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DigestPolicy {
    /// The server hashes the raw password.
    #[default]
    Server,
    /// The caller already supplies a PHC digest.
    Client,
}

/// Secret whose digest stands in for principals that do not exist.
const ABSENT_PRINCIPAL_SECRET: &str = "warden-absent-principal";

/// Credential store over the users collection.
pub struct CredentialStore {
    membership: Arc<ClusterMembership>,
    argon2: Argon2<'static>,
    /// Verified in place of a missing digest
    absent_digest: String,
}

impl CredentialStore {
    pub fn new(membership: Arc<ClusterMembership>) -> Result<Self> {
        let argon2 = Argon2::default();
        let absent_digest = derive_digest(&argon2, ABSENT_PRINCIPAL_SECRET)?;
        Ok(Self {
            membership,
            argon2,
            absent_digest,
        })
    }

    pub fn membership(&self) -> &ClusterMembership {
        &self.membership
    }

    pub fn get(&self, snapshot: &Snapshot, name: &UserName) -> Result<Option<UserDocument>> {
        snapshot
            .get(USERS_NS, &name.doc_id())
            .map(from_document)
            .transpose()
    }

    /// Principals of `db`, or of every database.
    pub fn list(&self, snapshot: &Snapshot, db: Option<&str>) -> Result<Vec<UserDocument>> {
        let Some(users) = snapshot.catalog.collection(USERS_NS) else {
            return Ok(Vec::new());
        };
        users
            .values()
            .map(from_document::<UserDocument>)
            .filter(|doc| match (doc, db) {
                (Ok(doc), Some(db)) => doc.db == db,
                _ => true,
            })
            .collect()
    }

    /// Check a password, returning the principal document on success.
    ///
    /// Principals without a password digest, known or not, are checked
    /// against a stand-in digest and always fail.
    pub fn verify(
        &self,
        snapshot: &Snapshot,
        name: &UserName,
        supplied: &str,
    ) -> Option<UserDocument> {
        let user = self.get(snapshot, name).ok().flatten();
        let digest = user
            .as_ref()
            .and_then(|u| u.credentials.argon2id.as_deref())
            .unwrap_or(&self.absent_digest);

        let matches = PasswordHash::new(digest).is_ok_and(|parsed| {
            self.argon2
                .verify_password(supplied.as_bytes(), &parsed)
                .is_ok()
        });

        user.filter(|u| matches && u.credentials.argon2id.is_some())
    }

    /// Writes creating a new principal.
    pub fn create_credential(
        &self,
        snapshot: &Snapshot,
        name: &UserName,
        secret: Secret,
        policy: DigestPolicy,
        roles: Vec<RoleName>,
    ) -> Result<Vec<DocWrite>> {
        if name.user.is_empty() {
            return Err(WardenError::InvalidOperation("user name cannot be empty".into()));
        }

        let credentials = if name.is_external() {
            if self.membership.is_member(&name.user) {
                tracing::warn!(principal = %name, "Refusing to create cluster member identity");
                return Err(WardenError::PolicyViolation(format!(
                    "cannot create an x.509 user with a subject that would be recognized as a cluster member: {}",
                    name.user
                )));
            }
            if secret != Secret::External {
                return Err(WardenError::PolicyViolation(format!(
                    "cannot set a password for {name}: principals in $external authenticate externally"
                )));
            }
            Credentials {
                argon2id: None,
                external: true,
            }
        } else {
            self.password_credentials(name, secret, policy)?
        };

        if self.get(snapshot, name)?.is_some() {
            return Err(WardenError::DuplicatePrincipal(format!(
                "User \"{name}\" already exists"
            )));
        }
        check_roles_exist(snapshot, &roles)?;

        let mut doc = UserDocument {
            id: name.doc_id(),
            user_id: uuid::Uuid::new_v4().to_string(),
            user: name.user.clone(),
            db: name.db.clone(),
            credentials,
            roles: dedup_roles(roles),
            created_at: 0,
            updated_at: 0,
        };
        doc.touch();
        doc.created_at = doc.updated_at;
        Ok(vec![DocWrite::insert(USERS_NS, doc.id.clone(), to_document(&doc)?)])
    }

    /// Writes replacing the digest, the direct roles, or both, as one entry.
    pub fn update_user(
        &self,
        snapshot: &Snapshot,
        name: &UserName,
        secret: Option<Secret>,
        policy: DigestPolicy,
        roles: Option<Vec<RoleName>>,
    ) -> Result<Vec<DocWrite>> {
        if secret.is_none() && roles.is_none() {
            return Err(WardenError::InvalidOperation(
                "updateUser needs a new password or new roles".into(),
            ));
        }
        let existing = self.require(snapshot, name)?;

        let mut updated = existing.clone();
        if let Some(secret) = secret {
            if existing.credentials.external {
                return Err(WardenError::PolicyViolation(format!(
                    "cannot set a password for external user {name}"
                )));
            }
            updated.credentials = self.password_credentials(name, secret, policy)?;
        }
        if let Some(roles) = roles {
            check_roles_exist(snapshot, &roles)?;
            updated.roles = dedup_roles(roles);
        }
        updated.touch();
        self.replace(&existing, &updated)
    }

    /// Writes removing a principal. Empty when it does not exist.
    pub fn drop_credential(&self, snapshot: &Snapshot, name: &UserName) -> Result<Vec<DocWrite>> {
        let id = name.doc_id();
        Ok(snapshot
            .get(USERS_NS, &id)
            .map(|doc| DocWrite::delete(USERS_NS, id, doc.clone()))
            .into_iter()
            .collect())
    }

    /// Writes removing every principal of `db`.
    pub fn drop_all(&self, snapshot: &Snapshot, db: &str) -> Result<Vec<DocWrite>> {
        Ok(self
            .list(snapshot, Some(db))?
            .into_iter()
            .filter_map(|user| {
                snapshot
                    .get(USERS_NS, &user.id)
                    .map(|doc| DocWrite::delete(USERS_NS, user.id.clone(), doc.clone()))
            })
            .collect())
    }

    /// Build the write replacing `existing` with `updated`.
    pub fn replace(
        &self,
        existing: &UserDocument,
        updated: &UserDocument,
    ) -> Result<Vec<DocWrite>> {
        Ok(vec![DocWrite::replace(
            USERS_NS,
            existing.id.clone(),
            to_document(existing)?,
            to_document(updated)?,
        )])
    }

    fn require(&self, snapshot: &Snapshot, name: &UserName) -> Result<UserDocument> {
        self.get(snapshot, name)?
            .ok_or_else(|| WardenError::NotFound(format!("User \"{name}\" not found")))
    }

    fn password_credentials(
        &self,
        name: &UserName,
        secret: Secret,
        policy: DigestPolicy,
    ) -> Result<Credentials> {
        let Secret::Password(password) = secret else {
            return Err(WardenError::InvalidOperation(format!(
                "external credentials are only allowed in $external, not for {name}"
            )));
        };
        if password.is_empty() {
            return Err(WardenError::InvalidOperation("password cannot be empty".into()));
        }

        let digest = match policy {
            DigestPolicy::Server => derive_digest(&self.argon2, &password)?,
            DigestPolicy::Client => {
                let parsed = PasswordHash::new(&password)
                    .map_err(|e| WardenError::Parse(format!("Invalid password digest: {e}")))?;
                if !parsed.algorithm.as_str().starts_with("argon2") {
                    return Err(WardenError::Parse(format!(
                        "Unsupported digest algorithm: {}",
                        parsed.algorithm
                    )));
                }
                password
            }
        };

        Ok(Credentials {
            argon2id: Some(digest),
            external: false,
        })
    }
}

/// Argon2id digest of `password` under a fresh salt, in PHC format.
fn derive_digest(argon2: &Argon2<'_>, password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|digest| digest.to_string())
        .map_err(|e| WardenError::InvalidOperation(format!("Failed to derive digest: {e}")))
}

fn check_roles_exist(snapshot: &Snapshot, roles: &[RoleName]) -> Result<()> {
    match roles.iter().find(|r| !snapshot.roles.role_exists(r)) {
        Some(missing) => Err(WardenError::NotFound(format!(
            "Role \"{missing}\" does not exist"
        ))),
        None => Ok(()),
    }
}

/// Drop repeated roles, keeping first occurrences in order.
pub(crate) fn dedup_roles(roles: Vec<RoleName>) -> Vec<RoleName> {
    let mut out: Vec<RoleName> = Vec::with_capacity(roles.len());
    for role in roles {
        if !out.contains(&role) {
            out.push(role);
        }
    }
    out
}
