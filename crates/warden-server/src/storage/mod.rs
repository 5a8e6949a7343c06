//! Document storage for Warden.
//!
//! User data and access-control data share one catalog and one log, so a
//! rollback that discards data writes discards auth writes at the same
//! positions.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use warden_common::{Result, WardenError};

pub mod catalog;
pub mod engine;
pub mod wal;

pub use catalog::{Catalog, Collection, DocWrite};
pub use engine::{RollbackSummary, Snapshot, StorageEngine, WriteTxn};

/// A stored document.
pub type Document = serde_json::Map<String, Value>;

/// System collection for principals and their credentials
pub const USERS_NS: &str = "admin.system.users";

/// System collection for user-defined roles
pub const ROLES_NS: &str = "admin.system.roles";

/// Build a `<db>.<collection>` namespace.
pub fn namespace(db: &str, collection: &str) -> String {
    format!("{db}.{collection}")
}

/// Split a namespace into database and collection.
pub fn split_namespace(ns: &str) -> Option<(&str, &str)> {
    ns.split_once('.')
}

/// Whether writes to `ns` change access-control state.
pub fn is_auth_namespace(ns: &str) -> bool {
    ns == USERS_NS || ns == ROLES_NS
}

/// Serialize a record into a document.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(WardenError::Storage(format!(
            "record did not serialize to a document: {other}"
        ))),
    }
}

/// Deserialize a record from a document.
pub fn from_document<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc.clone()))?)
}
