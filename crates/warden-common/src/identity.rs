//! Principal and role identities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Database holding the system collections and cluster-scoped roles.
pub const ADMIN_DB: &str = "admin";

/// Pseudo-database for principals authenticated outside the server
/// (x.509 certificates).
pub const EXTERNAL_DB: &str = "$external";

/// An authenticatable identity: user name scoped to its authentication database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserName {
    pub user: String,
    pub db: String,
}

impl UserName {
    pub fn new(user: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            db: db.into(),
        }
    }

    /// Whether this principal lives in the external realm.
    pub fn is_external(&self) -> bool {
        self.db == EXTERNAL_DB
    }

    /// Document `_id` inside the users collection.
    pub fn doc_id(&self) -> String {
        format!("{}.{}", self.db, self.user)
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.db)
    }
}

/// A role identity: role name scoped to the database that defines it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleName {
    pub role: String,
    pub db: String,
}

impl RoleName {
    pub fn new(role: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            db: db.into(),
        }
    }

    /// Document `_id` inside the roles collection.
    pub fn doc_id(&self) -> String {
        format!("{}.{}", self.db, self.role)
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.role, self.db)
    }
}
