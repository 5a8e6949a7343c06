//! Permissions and authorization primitives for Warden.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, WardenError, identity::ADMIN_DB};

// Actions

/// Actions that can be performed on resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    // Data operations
    /// Read documents
    Find,
    /// Insert new documents
    Insert,
    /// Update existing documents
    Update,
    /// Delete documents
    Remove,

    // Schema operations
    CreateCollection,
    DropCollection,
    DropDatabase,
    ListCollections,

    // Statistics
    DbStats,
    CollStats,

    // User and role administration
    CreateUser,
    DropUser,
    ChangePassword,
    ViewUser,
    CreateRole,
    DropRole,
    ViewRole,
    GrantRole,
    RevokeRole,

    // Cluster operations
    ReplSetGetStatus,
    /// Retrieve the server's in-memory log
    GetLog,
    Shutdown,
    /// Replication-internal operations
    Internal,

    // Wildcard
    /// All actions. Only granted through `__system`.
    AnyAction,
}

impl Action {
    /// Every action a read-only role carries.
    pub const READ: &'static [Action] = &[
        Action::Find,
        Action::ListCollections,
        Action::DbStats,
        Action::CollStats,
    ];

    /// Write actions layered on top of [`Action::READ`] by read-write roles.
    pub const WRITE: &'static [Action] = &[
        Action::Insert,
        Action::Update,
        Action::Remove,
        Action::CreateCollection,
        Action::DropCollection,
    ];

    pub const DB_ADMIN: &'static [Action] = &[
        Action::DbStats,
        Action::CollStats,
        Action::ListCollections,
        Action::CreateCollection,
        Action::DropCollection,
        Action::DropDatabase,
    ];

    pub const USER_ADMIN: &'static [Action] = &[
        Action::CreateUser,
        Action::DropUser,
        Action::ChangePassword,
        Action::ViewUser,
        Action::CreateRole,
        Action::DropRole,
        Action::ViewRole,
        Action::GrantRole,
        Action::RevokeRole,
    ];

    /// Wire/document name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Find => "find",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Remove => "remove",
            Action::CreateCollection => "createCollection",
            Action::DropCollection => "dropCollection",
            Action::DropDatabase => "dropDatabase",
            Action::ListCollections => "listCollections",
            Action::DbStats => "dbStats",
            Action::CollStats => "collStats",
            Action::CreateUser => "createUser",
            Action::DropUser => "dropUser",
            Action::ChangePassword => "changePassword",
            Action::ViewUser => "viewUser",
            Action::CreateRole => "createRole",
            Action::DropRole => "dropRole",
            Action::ViewRole => "viewRole",
            Action::GrantRole => "grantRole",
            Action::RevokeRole => "revokeRole",
            Action::ReplSetGetStatus => "replSetGetStatus",
            Action::GetLog => "getLog",
            Action::Shutdown => "shutdown",
            Action::Internal => "internal",
            Action::AnyAction => "anyAction",
        }
    }
}

impl FromStr for Action {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "find" => Ok(Action::Find),
            "insert" => Ok(Action::Insert),
            "update" => Ok(Action::Update),
            "remove" => Ok(Action::Remove),
            "createCollection" => Ok(Action::CreateCollection),
            "dropCollection" => Ok(Action::DropCollection),
            "dropDatabase" => Ok(Action::DropDatabase),
            "listCollections" => Ok(Action::ListCollections),
            "dbStats" => Ok(Action::DbStats),
            "collStats" => Ok(Action::CollStats),
            "createUser" => Ok(Action::CreateUser),
            "dropUser" => Ok(Action::DropUser),
            "changePassword" => Ok(Action::ChangePassword),
            "viewUser" => Ok(Action::ViewUser),
            "createRole" => Ok(Action::CreateRole),
            "dropRole" => Ok(Action::DropRole),
            "viewRole" => Ok(Action::ViewRole),
            "grantRole" => Ok(Action::GrantRole),
            "revokeRole" => Ok(Action::RevokeRole),
            "replSetGetStatus" => Ok(Action::ReplSetGetStatus),
            "getLog" => Ok(Action::GetLog),
            "shutdown" => Ok(Action::Shutdown),
            "internal" => Ok(Action::Internal),
            "anyAction" => Ok(Action::AnyAction),
            _ => Err(WardenError::Parse(format!("Unknown action: {s}"))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Resources

/// Collections under this prefix are only matched by explicit patterns.
const SYSTEM_COLLECTION_PREFIX: &str = "system.";

/// A concrete resource a command operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Cluster,
    Database(String),
    Collection { db: String, collection: String },
}

impl Resource {
    pub fn database(db: impl Into<String>) -> Self {
        Resource::Database(db.into())
    }

    pub fn collection(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Resource::Collection {
            db: db.into(),
            collection: collection.into(),
        }
    }

    fn is_system_collection(&self) -> bool {
        matches!(self, Resource::Collection { collection, .. } if collection.starts_with(SYSTEM_COLLECTION_PREFIX))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cluster => write!(f, "cluster"),
            Resource::Database(db) => write!(f, "{db}"),
            Resource::Collection { db, collection } => write!(f, "{db}.{collection}"),
        }
    }
}

/// A pattern over resources, as written in role privileges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ResourceDocument", into = "ResourceDocument")]
pub enum ResourcePattern {
    /// Cluster-wide operations
    Cluster,

    /// A database and every non-system collection in it.
    ///
    /// Written as `{db: "<name>", collection: ""}`.
    Database { db: String },

    /// One collection in one database
    Collection { db: String, collection: String },

    /// A collection name in every database (`{db: "", collection: "<name>"}`)
    CollectionInAnyDatabase { collection: String },

    /// Every database and non-system collection, not the cluster
    /// (`{db: "", collection: ""}`).
    AnyNormalResource,

    /// Everything, system collections and cluster included.
    AnyResource,
}

impl ResourcePattern {
    pub fn database(db: impl Into<String>) -> Self {
        ResourcePattern::Database { db: db.into() }
    }

    pub fn collection(db: impl Into<String>, collection: impl Into<String>) -> Self {
        let (db, collection) = (db.into(), collection.into());
        match (db.is_empty(), collection.is_empty()) {
            (true, true) => ResourcePattern::AnyNormalResource,
            (true, false) => ResourcePattern::CollectionInAnyDatabase { collection },
            (false, true) => ResourcePattern::Database { db },
            (false, false) => ResourcePattern::Collection { db, collection },
        }
    }

    /// Check if this pattern covers the given resource.
    pub fn matches(&self, resource: &Resource) -> bool {
        match (self, resource) {
            (ResourcePattern::AnyResource, _) => true,

            (ResourcePattern::Cluster, Resource::Cluster) => true,

            (ResourcePattern::AnyNormalResource, Resource::Database(_)) => true,
            (ResourcePattern::AnyNormalResource, r @ Resource::Collection { .. }) => {
                !r.is_system_collection()
            }

            (ResourcePattern::Database { db }, Resource::Database(target)) => db == target,
            (ResourcePattern::Database { db }, r @ Resource::Collection { db: target, .. }) => {
                db == target && !r.is_system_collection()
            }

            (
                ResourcePattern::Collection { db, collection },
                Resource::Collection {
                    db: target_db,
                    collection: target_collection,
                },
            ) => db == target_db && collection == target_collection,

            (
                ResourcePattern::CollectionInAnyDatabase { collection },
                Resource::Collection {
                    collection: target, ..
                },
            ) => collection == target,

            _ => false,
        }
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePattern::Cluster => write!(f, "{{cluster: true}}"),
            ResourcePattern::Database { db } => write!(f, "{{db: {db}, collection: \"\"}}"),
            ResourcePattern::Collection { db, collection } => {
                write!(f, "{{db: {db}, collection: {collection}}}")
            }
            ResourcePattern::CollectionInAnyDatabase { collection } => {
                write!(f, "{{db: \"\", collection: {collection}}}")
            }
            ResourcePattern::AnyNormalResource => write!(f, "{{db: \"\", collection: \"\"}}"),
            ResourcePattern::AnyResource => write!(f, "{{anyResource: true}}"),
        }
    }
}

/// Document form of a [`ResourcePattern`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any_resource: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl TryFrom<ResourceDocument> for ResourcePattern {
    type Error = WardenError;

    fn try_from(doc: ResourceDocument) -> Result<Self> {
        match doc {
            ResourceDocument {
                cluster: Some(true),
                any_resource: None,
                db: None,
                collection: None,
            } => Ok(ResourcePattern::Cluster),
            ResourceDocument {
                cluster: None,
                any_resource: Some(true),
                db: None,
                collection: None,
            } => Ok(ResourcePattern::AnyResource),
            ResourceDocument {
                cluster: None,
                any_resource: None,
                db: Some(db),
                collection: Some(collection),
            } => Ok(ResourcePattern::collection(db, collection)),
            other => Err(WardenError::Parse(format!(
                "Invalid resource pattern: {other:?}"
            ))),
        }
    }
}

impl From<ResourcePattern> for ResourceDocument {
    fn from(pattern: ResourcePattern) -> Self {
        let (db, collection) = match pattern {
            ResourcePattern::Cluster => {
                return ResourceDocument {
                    cluster: Some(true),
                    ..Default::default()
                };
            }
            ResourcePattern::AnyResource => {
                return ResourceDocument {
                    any_resource: Some(true),
                    ..Default::default()
                };
            }
            ResourcePattern::Database { db } => (db, String::new()),
            ResourcePattern::Collection { db, collection } => (db, collection),
            ResourcePattern::CollectionInAnyDatabase { collection } => (String::new(), collection),
            ResourcePattern::AnyNormalResource => (String::new(), String::new()),
        };
        ResourceDocument {
            db: Some(db),
            collection: Some(collection),
            ..Default::default()
        }
    }
}

// Privilege

/// A resource pattern together with the actions granted on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privilege {
    pub resource: ResourcePattern,
    pub actions: BTreeSet<Action>,
}

impl Privilege {
    pub fn new(resource: ResourcePattern, actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            resource,
            actions: actions.into_iter().collect(),
        }
    }

    /// Check if this privilege allows the given action on the given resource
    pub fn allows(&self, resource: &Resource, action: Action) -> bool {
        let action_matches =
            self.actions.contains(&Action::AnyAction) || self.actions.contains(&action);
        action_matches && self.resource.matches(resource)
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<&str> = self.actions.iter().map(|a| a.as_str()).collect();
        write!(f, "{} [{}]", self.resource, actions.join(", "))
    }
}

// Privilege Set

/// A flattened, de-duplicated set of privileges.
///
/// Actions granted on the same resource pattern are unioned. Iteration order
/// is the pattern's `Ord`, so two sets built from the same grants compare
/// and serialize identically regardless of grant order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Privilege>", into = "Vec<Privilege>")]
pub struct PrivilegeSet {
    grants: BTreeMap<ResourcePattern, BTreeSet<Action>>,
}

impl PrivilegeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a privilege to the set, unioning actions on an existing pattern.
    pub fn add(&mut self, privilege: Privilege) {
        self.grants
            .entry(privilege.resource)
            .or_default()
            .extend(privilege.actions);
    }

    /// Remove the privilege's actions from its pattern.
    pub fn remove(&mut self, privilege: &Privilege) {
        if let Some(actions) = self.grants.get_mut(&privilege.resource) {
            for action in &privilege.actions {
                actions.remove(action);
            }
            if actions.is_empty() {
                self.grants.remove(&privilege.resource);
            }
        }
    }

    /// Merge another privilege set into this one
    pub fn merge(&mut self, other: &PrivilegeSet) {
        for (resource, actions) in &other.grants {
            self.grants
                .entry(resource.clone())
                .or_default()
                .extend(actions.iter().copied());
        }
    }

    /// Check if any privilege in the set allows the action on the resource
    pub fn allows(&self, resource: &Resource, action: Action) -> bool {
        self.grants.iter().any(|(pattern, actions)| {
            (actions.contains(&Action::AnyAction) || actions.contains(&action))
                && pattern.matches(resource)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// All privileges, ordered by resource pattern.
    pub fn to_vec(&self) -> Vec<Privilege> {
        self.grants
            .iter()
            .map(|(resource, actions)| Privilege {
                resource: resource.clone(),
                actions: actions.clone(),
            })
            .collect()
    }
}

impl From<Vec<Privilege>> for PrivilegeSet {
    fn from(privileges: Vec<Privilege>) -> Self {
        let mut set = PrivilegeSet::new();
        for privilege in privileges {
            set.add(privilege);
        }
        set
    }
}

impl From<PrivilegeSet> for Vec<Privilege> {
    fn from(set: PrivilegeSet) -> Self {
        set.to_vec()
    }
}

impl FromIterator<Privilege> for PrivilegeSet {
    fn from_iter<I: IntoIterator<Item = Privilege>>(iter: I) -> Self {
        let mut set = PrivilegeSet::new();
        for privilege in iter {
            set.add(privilege);
        }
        set
    }
}

// Built-in Roles

/// Built-in role definitions.
///
/// Built-ins exist implicitly in every database. The cluster-wide and
/// any-database variants only exist in `admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinRole {
    /// Read-only access to a database
    Read,
    /// Read and write access to a database
    ReadWrite,
    /// Schema management for a database
    DbAdmin,
    /// User and role management for a database
    UserAdmin,
    /// ReadWrite, DbAdmin and UserAdmin combined
    DbOwner,
    ClusterMonitor,
    ClusterAdmin,
    ReadAnyDatabase,
    ReadWriteAnyDatabase,
    UserAdminAnyDatabase,
    DbAdminAnyDatabase,
    /// Full administrative access, without the internal `anyAction` grant
    Root,
    /// Cluster-internal role holding `anyAction` on every resource
    System,
}

impl BuiltinRole {
    pub const ALL: [BuiltinRole; 13] = [
        BuiltinRole::Read,
        BuiltinRole::ReadWrite,
        BuiltinRole::DbAdmin,
        BuiltinRole::UserAdmin,
        BuiltinRole::DbOwner,
        BuiltinRole::ClusterMonitor,
        BuiltinRole::ClusterAdmin,
        BuiltinRole::ReadAnyDatabase,
        BuiltinRole::ReadWriteAnyDatabase,
        BuiltinRole::UserAdminAnyDatabase,
        BuiltinRole::DbAdminAnyDatabase,
        BuiltinRole::Root,
        BuiltinRole::System,
    ];

    /// Look up a built-in role defined in `db`.
    pub fn lookup(name: &str, db: &str) -> Option<Self> {
        let role = BuiltinRole::ALL.into_iter().find(|r| r.name() == name)?;
        if role.admin_only() && db != ADMIN_DB {
            return None;
        }
        Some(role)
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinRole::Read => "read",
            BuiltinRole::ReadWrite => "readWrite",
            BuiltinRole::DbAdmin => "dbAdmin",
            BuiltinRole::UserAdmin => "userAdmin",
            BuiltinRole::DbOwner => "dbOwner",
            BuiltinRole::ClusterMonitor => "clusterMonitor",
            BuiltinRole::ClusterAdmin => "clusterAdmin",
            BuiltinRole::ReadAnyDatabase => "readAnyDatabase",
            BuiltinRole::ReadWriteAnyDatabase => "readWriteAnyDatabase",
            BuiltinRole::UserAdminAnyDatabase => "userAdminAnyDatabase",
            BuiltinRole::DbAdminAnyDatabase => "dbAdminAnyDatabase",
            BuiltinRole::Root => "root",
            BuiltinRole::System => "__system",
        }
    }

    /// Whether the role only exists in the `admin` database.
    pub fn admin_only(self) -> bool {
        !matches!(
            self,
            BuiltinRole::Read
                | BuiltinRole::ReadWrite
                | BuiltinRole::DbAdmin
                | BuiltinRole::UserAdmin
                | BuiltinRole::DbOwner
        )
    }

    /// Get the privileges for this role as defined in `db`.
    pub fn privileges(self, db: &str) -> PrivilegeSet {
        let mut set = PrivilegeSet::new();
        let database = ResourcePattern::database(db);
        let any = ResourcePattern::AnyNormalResource;

        match self {
            BuiltinRole::Read => {
                set.add(Privilege::new(database, Action::READ.iter().copied()));
            }
            BuiltinRole::ReadWrite => {
                set.add(Privilege::new(
                    database,
                    Action::READ.iter().chain(Action::WRITE).copied(),
                ));
            }
            BuiltinRole::DbAdmin => {
                set.add(Privilege::new(database, Action::DB_ADMIN.iter().copied()));
            }
            BuiltinRole::UserAdmin => {
                set.add(Privilege::new(database, Action::USER_ADMIN.iter().copied()));
            }
            BuiltinRole::DbOwner => {
                set.merge(&BuiltinRole::ReadWrite.privileges(db));
                set.merge(&BuiltinRole::DbAdmin.privileges(db));
                set.merge(&BuiltinRole::UserAdmin.privileges(db));
            }
            BuiltinRole::ClusterMonitor => {
                set.add(Privilege::new(
                    ResourcePattern::Cluster,
                    [Action::ReplSetGetStatus, Action::GetLog],
                ));
                set.add(Privilege::new(
                    any,
                    [Action::DbStats, Action::CollStats, Action::ListCollections],
                ));
            }
            BuiltinRole::ClusterAdmin => {
                set.merge(&BuiltinRole::ClusterMonitor.privileges(db));
                set.add(Privilege::new(ResourcePattern::Cluster, [Action::Shutdown]));
                set.add(Privilege::new(any, [Action::DropDatabase]));
            }
            BuiltinRole::ReadAnyDatabase => {
                set.add(Privilege::new(any, Action::READ.iter().copied()));
            }
            BuiltinRole::ReadWriteAnyDatabase => {
                set.add(Privilege::new(
                    any,
                    Action::READ.iter().chain(Action::WRITE).copied(),
                ));
            }
            BuiltinRole::UserAdminAnyDatabase => {
                set.add(Privilege::new(any, Action::USER_ADMIN.iter().copied()));
            }
            BuiltinRole::DbAdminAnyDatabase => {
                set.add(Privilege::new(any, Action::DB_ADMIN.iter().copied()));
            }
            BuiltinRole::Root => {
                set.merge(&BuiltinRole::ReadWriteAnyDatabase.privileges(db));
                set.merge(&BuiltinRole::DbAdminAnyDatabase.privileges(db));
                set.merge(&BuiltinRole::UserAdminAnyDatabase.privileges(db));
                set.merge(&BuiltinRole::ClusterAdmin.privileges(db));
            }
            BuiltinRole::System => {
                set.add(Privilege::new(
                    ResourcePattern::AnyResource,
                    [Action::AnyAction],
                ));
            }
        }

        set
    }
}

impl fmt::Display for BuiltinRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Tests
