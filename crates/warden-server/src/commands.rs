//! Commands a node executes and the privileges each one declares.

use serde::Serialize;
use warden_common::{
    RoleName, UserName,
    permissions::{Action, Privilege, Resource},
};

use crate::auth::{AuthRequest, DigestPolicy};
use crate::replication::{LogPosition, MemberState, ReplSetStatus, WriteConcern};
use crate::storage::Document;

/// One operation inside an `eval` body or a `group` side effect.
///
/// Steps run against the database of the command that carries them.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Find { collection: String, filter: Document },
    Count { collection: String },
    Insert { collection: String, document: Document },
}

impl Step {
    pub fn required(&self, db: &str) -> (Resource, Action) {
        match self {
            Step::Find { collection, .. } | Step::Count { collection } => {
                (Resource::collection(db, collection), Action::Find)
            }
            Step::Insert { collection, .. } => {
                (Resource::collection(db, collection), Action::Insert)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::Find { .. } => "find",
            Step::Count { .. } => "count",
            Step::Insert { .. } => "insert",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    // Session
    Authenticate(AuthRequest),
    Logout {
        db: String,
    },
    IsMaster,

    // Users
    CreateUser {
        db: String,
        user: String,
        /// Absent for `$external` principals
        password: Option<String>,
        digest: DigestPolicy,
        roles: Vec<RoleName>,
        write_concern: Option<WriteConcern>,
    },
    UpdateUser {
        db: String,
        user: String,
        password: Option<String>,
        digest: DigestPolicy,
        /// Replaces the direct grants when present
        roles: Option<Vec<RoleName>>,
        write_concern: Option<WriteConcern>,
    },
    DropUser {
        db: String,
        user: String,
        write_concern: Option<WriteConcern>,
    },
    DropAllUsers {
        db: String,
        write_concern: Option<WriteConcern>,
    },
    UsersInfo {
        db: String,
        user: Option<String>,
        show_privileges: bool,
    },

    // Roles
    CreateRole {
        db: String,
        role: String,
        privileges: Vec<Privilege>,
        roles: Vec<RoleName>,
        write_concern: Option<WriteConcern>,
    },
    GrantPrivilegesToRole {
        db: String,
        role: String,
        privileges: Vec<Privilege>,
        write_concern: Option<WriteConcern>,
    },
    RevokePrivilegesFromRole {
        db: String,
        role: String,
        privileges: Vec<Privilege>,
        write_concern: Option<WriteConcern>,
    },
    GrantRolesToRole {
        db: String,
        role: String,
        roles: Vec<RoleName>,
        write_concern: Option<WriteConcern>,
    },
    RevokeRolesFromRole {
        db: String,
        role: String,
        roles: Vec<RoleName>,
        write_concern: Option<WriteConcern>,
    },
    GrantRolesToUser {
        db: String,
        user: String,
        roles: Vec<RoleName>,
        write_concern: Option<WriteConcern>,
    },
    RevokeRolesFromUser {
        db: String,
        user: String,
        roles: Vec<RoleName>,
        write_concern: Option<WriteConcern>,
    },
    DropRole {
        db: String,
        role: String,
        write_concern: Option<WriteConcern>,
    },
    RolesInfo {
        db: String,
        role: Option<String>,
        show_privileges: bool,
    },

    // Documents
    Insert {
        db: String,
        collection: String,
        documents: Vec<Document>,
        write_concern: Option<WriteConcern>,
    },
    Find {
        db: String,
        collection: String,
        /// Top-level equality match; empty matches everything
        filter: Document,
    },
    Count {
        db: String,
        collection: String,
    },
    DbStats {
        db: String,
    },
    CollStats {
        db: String,
        collection: String,
    },
    Drop {
        db: String,
        collection: String,
        write_concern: Option<WriteConcern>,
    },
    DropDatabase {
        db: String,
        write_concern: Option<WriteConcern>,
    },

    // Cluster
    ReplSetGetStatus,
    GetLog {
        name: String,
    },
    Eval {
        db: String,
        steps: Vec<Step>,
    },
    /// Count documents per distinct value of `key`, running `side_effects`
    /// the way a reduce function with writes would.
    Group {
        db: String,
        collection: String,
        key: String,
        side_effects: Vec<Step>,
    },
}

fn db(name: &str) -> Resource {
    Resource::database(name)
}

fn grant_on_role_dbs(
    roles: &[RoleName],
    action: Action,
) -> impl Iterator<Item = (Resource, Action)> + '_ {
    roles.iter().map(move |r| (db(&r.db), action))
}

impl Command {
    /// Command name as reported in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Authenticate(_) => "authenticate",
            Command::Logout { .. } => "logout",
            Command::IsMaster => "isMaster",
            Command::CreateUser { .. } => "createUser",
            Command::UpdateUser { .. } => "updateUser",
            Command::DropUser { .. } => "dropUser",
            Command::DropAllUsers { .. } => "dropAllUsersFromDatabase",
            Command::UsersInfo { .. } => "usersInfo",
            Command::CreateRole { .. } => "createRole",
            Command::GrantPrivilegesToRole { .. } => "grantPrivilegesToRole",
            Command::RevokePrivilegesFromRole { .. } => "revokePrivilegesFromRole",
            Command::GrantRolesToRole { .. } => "grantRolesToRole",
            Command::RevokeRolesFromRole { .. } => "revokeRolesFromRole",
            Command::GrantRolesToUser { .. } => "grantRolesToUser",
            Command::RevokeRolesFromUser { .. } => "revokeRolesFromUser",
            Command::DropRole { .. } => "dropRole",
            Command::RolesInfo { .. } => "rolesInfo",
            Command::Insert { .. } => "insert",
            Command::Find { .. } => "find",
            Command::Count { .. } => "count",
            Command::DbStats { .. } => "dbStats",
            Command::CollStats { .. } => "collStats",
            Command::Drop { .. } => "drop",
            Command::DropDatabase { .. } => "dropDatabase",
            Command::ReplSetGetStatus => "replSetGetStatus",
            Command::GetLog { .. } => "getLog",
            Command::Eval { .. } => "eval",
            Command::Group { .. } => "group",
        }
    }

    /// Whether the command mutates state and therefore needs a primary.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::CreateUser { .. }
                | Command::UpdateUser { .. }
                | Command::DropUser { .. }
                | Command::DropAllUsers { .. }
                | Command::CreateRole { .. }
                | Command::GrantPrivilegesToRole { .. }
                | Command::RevokePrivilegesFromRole { .. }
                | Command::GrantRolesToRole { .. }
                | Command::RevokeRolesFromRole { .. }
                | Command::GrantRolesToUser { .. }
                | Command::RevokeRolesFromUser { .. }
                | Command::DropRole { .. }
                | Command::Insert { .. }
                | Command::Drop { .. }
                | Command::DropDatabase { .. }
        )
    }

    /// Privileges the command needs before it runs.
    ///
    /// Steps of `eval` and `group` bodies are authorized separately as they
    /// execute.
    pub fn required(&self) -> Vec<(Resource, Action)> {
        match self {
            Command::Authenticate(_) | Command::Logout { .. } | Command::IsMaster => Vec::new(),

            Command::CreateUser { db: d, roles, .. } => {
                std::iter::once((db(d), Action::CreateUser))
                    .chain(grant_on_role_dbs(roles, Action::GrantRole))
                    .collect()
            }
            Command::UpdateUser {
                db: d,
                password,
                roles,
                ..
            } => {
                let mut required = Vec::new();
                if password.is_some() || roles.is_none() {
                    required.push((db(d), Action::ChangePassword));
                }
                if let Some(roles) = roles {
                    required.push((db(d), Action::RevokeRole));
                    required.extend(grant_on_role_dbs(roles, Action::GrantRole));
                }
                required
            }
            Command::DropUser { db: d, .. } | Command::DropAllUsers { db: d, .. } => {
                vec![(db(d), Action::DropUser)]
            }
            Command::UsersInfo { db: d, .. } => vec![(db(d), Action::ViewUser)],

            Command::CreateRole { db: d, roles, .. } => {
                std::iter::once((db(d), Action::CreateRole))
                    .chain(grant_on_role_dbs(roles, Action::GrantRole))
                    .collect()
            }
            Command::GrantPrivilegesToRole { db: d, .. } => vec![(db(d), Action::GrantRole)],
            Command::RevokePrivilegesFromRole { db: d, .. } => vec![(db(d), Action::RevokeRole)],
            Command::GrantRolesToRole { db: d, roles, .. } => {
                std::iter::once((db(d), Action::GrantRole))
                    .chain(grant_on_role_dbs(roles, Action::GrantRole))
                    .collect()
            }
            Command::RevokeRolesFromRole { db: d, .. } => vec![(db(d), Action::RevokeRole)],
            Command::GrantRolesToUser { db: d, roles, .. } => {
                if roles.is_empty() {
                    vec![(db(d), Action::GrantRole)]
                } else {
                    grant_on_role_dbs(roles, Action::GrantRole).collect()
                }
            }
            Command::RevokeRolesFromUser { db: d, roles, .. } => {
                if roles.is_empty() {
                    vec![(db(d), Action::RevokeRole)]
                } else {
                    grant_on_role_dbs(roles, Action::RevokeRole).collect()
                }
            }
            Command::DropRole { db: d, .. } => vec![(db(d), Action::DropRole)],
            Command::RolesInfo { db: d, .. } => vec![(db(d), Action::ViewRole)],

            Command::Insert { db, collection, .. } => {
                vec![(Resource::collection(db, collection), Action::Insert)]
            }
            Command::Find { db, collection, .. } | Command::Count { db, collection } => {
                vec![(Resource::collection(db, collection), Action::Find)]
            }
            Command::DbStats { db: d } => vec![(db(d), Action::DbStats)],
            Command::CollStats { db, collection } => {
                vec![(Resource::collection(db, collection), Action::CollStats)]
            }
            Command::Drop { db, collection, .. } => {
                vec![(Resource::collection(db, collection), Action::DropCollection)]
            }
            Command::DropDatabase { db: d, .. } => vec![(db(d), Action::DropDatabase)],

            Command::ReplSetGetStatus => vec![(Resource::Cluster, Action::ReplSetGetStatus)],
            Command::GetLog { .. } => vec![(Resource::Cluster, Action::GetLog)],
            Command::Eval { db: d, .. } => vec![
                (Resource::Cluster, Action::AnyAction),
                (db(d), Action::AnyAction),
            ],
            Command::Group { db, collection, .. } => {
                vec![(Resource::collection(db, collection), Action::Find)]
            }
        }
    }
}

/// A principal as reported by `usersInfo`. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user: UserName,
    pub user_id: String,
    pub external: bool,
    pub roles: Vec<RoleName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileges: Option<Vec<Privilege>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleInfo {
    pub role: RoleName,
    pub is_builtin: bool,
    pub privileges: Vec<Privilege>,
    pub roles: Vec<RoleName>,
    /// Closure over inherited roles, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherited_privileges: Option<Vec<Privilege>>,
}

/// Result of a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Reply {
    Authenticated {
        user: UserName,
    },
    LoggedOut {
        user: Option<UserName>,
    },
    IsMaster {
        is_master: bool,
        set_name: Option<String>,
        state: MemberState,
    },
    /// `position` is absent when nothing needed to change.
    Write {
        position: Option<LogPosition>,
        n: usize,
    },
    Documents {
        documents: Vec<Document>,
    },
    Count {
        n: usize,
    },
    Stats {
        stats: Document,
    },
    Users {
        users: Vec<UserInfo>,
    },
    Roles {
        roles: Vec<RoleInfo>,
    },
    Status {
        status: ReplSetStatus,
    },
    Lines {
        lines: Vec<String>,
    },
    Batch {
        results: Vec<Reply>,
    },
}

impl Reply {
    pub fn documents(&self) -> &[Document] {
        match self {
            Reply::Documents { documents } => documents,
            _ => &[],
        }
    }

    pub fn count(&self) -> Option<usize> {
        match self {
            Reply::Count { n } | Reply::Write { n, .. } => Some(*n),
            _ => None,
        }
    }

    pub fn position(&self) -> Option<LogPosition> {
        match self {
            Reply::Write { position, .. } => *position,
            _ => None,
        }
    }
}
