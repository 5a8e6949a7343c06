//! A Warden node.
//!
//! The node owns one member's storage and access-control state. Every request
//! goes through [`Node::execute`], which authorizes the privileges the command
//! declares before running it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use warden_common::{
    Result, RoleName, UserName, WardenError,
    permissions::{BuiltinRole, PrivilegeSet},
};

use crate::auth::{AuthManager, AuthRequest, AuthSession, PeerInfo, Secret};
use crate::authz::{AuthorizationEngine, RoleStore};
use crate::commands::{Command, Reply, RoleInfo, Step, UserInfo};
use crate::config::Config;
use crate::replication::{
    LogEntry, LogView, MemberId, MemberState, MemberStatusReport, ReplicaSetControl,
    WriteConcern, plan_rollback,
};
use crate::storage::{
    DocWrite, Document, RollbackSummary, Snapshot, StorageEngine, is_auth_namespace, namespace,
};

/// Write concern for plain document writes.
const DATA_WRITE_CONCERN: WriteConcern = WriteConcern::Nodes(1);

const GLOBAL_LOG: &str = "global";
const STARTUP_WARNINGS_LOG: &str = "startupWarnings";

/// Bounded in-memory log served by `getLog`.
struct RamLog {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl RamLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemberStatus {
    state: MemberState,
    term: u64,
    voting: bool,
}

pub struct Node {
    id: MemberId,
    name: String,
    config: Config,
    storage: StorageEngine,
    status: RwLock<MemberStatus>,
    auth: AuthManager,
    roles: RoleStore,
    authz: AuthorizationEngine,
    replica_set: RwLock<Option<Weak<dyn ReplicaSetControl>>>,
    global_log: RamLog,
    startup_warnings: RamLog,
    connections: DashMap<u64, Instant>,
    running: AtomicBool,
}

impl Node {
    /// Open a node, recovering its storage from the WAL if one is configured.
    ///
    /// A standalone node starts as primary. A replica-set member starts as a
    /// secondary until it is elected.
    pub fn open(config: Config, id: MemberId) -> Result<Self> {
        let storage = StorageEngine::open(&config.storage)?;
        let auth = AuthManager::new(&config.auth)?;
        let authz = AuthorizationEngine::new(&config.auth);

        let last = storage.last_position();
        let (state, term) = match config.replication.set_name {
            None => (MemberState::Primary, last.term.max(1)),
            Some(_) => (MemberState::Secondary, last.term),
        };

        let node = Self {
            id,
            name: config.node.name.clone(),
            storage,
            status: RwLock::new(MemberStatus {
                state,
                term,
                voting: true,
            }),
            auth,
            roles: RoleStore::new(),
            authz,
            replica_set: RwLock::new(None),
            global_log: RamLog::new(config.node.ram_log_capacity),
            startup_warnings: RamLog::new(config.node.ram_log_capacity),
            connections: DashMap::new(),
            running: AtomicBool::new(true),
            config,
        };

        if !node.config.auth.enabled {
            node.startup_warnings
                .push("Access control is not enabled for the database");
            warn!(node = %node.name, "Access control is not enabled");
        }
        if !node.storage.is_durable() {
            node.startup_warnings
                .push("No data directory configured; data is kept in memory only");
        }

        info!(
            node = %node.name,
            state = %state,
            term,
            last_applied = %last,
            "Node opened"
        );
        Ok(node)
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn snapshot(&self) -> std::sync::Arc<Snapshot> {
        self.storage.snapshot()
    }

    pub fn state(&self) -> MemberState {
        self.status.read().state
    }

    pub fn term(&self) -> u64 {
        self.status.read().term
    }

    pub fn is_primary(&self) -> bool {
        self.state() == MemberState::Primary
    }

    pub fn is_voting(&self) -> bool {
        self.status.read().voting
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn log_view(&self) -> LogView {
        self.storage.log_view()
    }

    pub fn status_report(&self) -> MemberStatusReport {
        let status = *self.status.read();
        MemberStatusReport {
            id: self.id,
            name: self.name.clone(),
            state: status.state,
            last_applied: self.storage.last_position(),
            voting: status.voting,
            arbiter: false,
        }
    }

    /// Effective privileges of `user` on this node's current role graph.
    pub fn effective_privileges(&self, user: &UserName) -> PrivilegeSet {
        self.storage.snapshot().roles.resolve_effective_privileges(user)
    }

    /// Link the node to the replica set that ships its writes.
    pub fn attach(&self, replica_set: Weak<dyn ReplicaSetControl>) {
        *self.replica_set.write() = Some(replica_set);
    }

    pub(crate) fn register_connection(&self, id: u64) {
        self.connections.insert(id, Instant::now());
    }

    pub(crate) fn unregister_connection(&self, id: u64) {
        self.connections.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop serving. Every open connection is closed on its next request.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.status.write().state = MemberState::Down;
        info!(
            node = %self.name,
            connections = self.connections.len(),
            "Shutting down, closing connections"
        );
        self.connections.clear();
    }

    // Replica-set hooks

    /// Take over as primary in `term`.
    pub fn become_primary(&self, term: u64) -> Result<()> {
        let mut status = self.status.write();
        match status.state {
            MemberState::Fatal | MemberState::Down => {
                return Err(WardenError::InvalidOperation(format!(
                    "{} cannot become primary while {}",
                    self.name, status.state
                )));
            }
            MemberState::Rollback | MemberState::RecoveringFromRollback => {
                return Err(WardenError::RollbackInProgress);
            }
            MemberState::Primary | MemberState::Secondary => {}
        }
        if term < status.term {
            return Err(WardenError::InvalidOperation(format!(
                "term {term} is older than current term {}",
                status.term
            )));
        }
        status.state = MemberState::Primary;
        status.term = term;
        drop(status);

        info!(node = %self.name, term, "Became primary");
        self.global_log
            .push(format!("transition to PRIMARY in term {term}"));
        Ok(())
    }

    pub fn step_down(&self) {
        let mut status = self.status.write();
        if status.state == MemberState::Primary {
            status.state = MemberState::Secondary;
            drop(status);
            info!(node = %self.name, "Stepped down");
            self.global_log.push("transition to SECONDARY");
        }
    }

    /// Catch up with `source`, rolling back first if the logs diverged.
    pub fn sync_from(&self, source: &LogView) -> Result<usize> {
        match self.state() {
            MemberState::Fatal => {
                return Err(WardenError::RollbackFailed(format!(
                    "{} is in FATAL state",
                    self.name
                )));
            }
            MemberState::Down => return Err(WardenError::ConnectionClosed),
            _ => {}
        }

        let local = self.storage.last_position();
        let applied = if source.contains(local) {
            self.storage.apply_replicated(source.after(local))?
        } else {
            self.rollback_to_common_point(source)?.reapplied
        };

        let last = self.storage.last_position();
        let mut status = self.status.write();
        status.term = status.term.max(last.term);
        if applied > 0 {
            debug!(node = %self.name, applied, last_applied = %last, "Applied replicated entries");
        }
        Ok(applied)
    }

    /// Undo local entries the sync source does not have and take its entries
    /// in their place.
    ///
    /// Requests fail with `RollbackInProgress` until the new snapshot is in
    /// place. If no common point exists the member goes `FATAL` and stops
    /// voting.
    pub fn rollback_to_common_point(&self, source: &LogView) -> Result<RollbackSummary> {
        self.status.write().state = MemberState::Rollback;
        info!(
            node = %self.name,
            local_last = %self.storage.last_position(),
            source_last = %source.last(),
            "Starting rollback"
        );

        let result = plan_rollback(&self.storage.log_view(), source)
            .and_then(|plan| self.storage.rollback_to(&plan));

        match result {
            Ok(summary) => {
                self.status.write().state = MemberState::RecoveringFromRollback;
                info!(
                    node = %self.name,
                    common_point = %summary.common_point,
                    undone = summary.undone,
                    reapplied = summary.reapplied,
                    auth_entries_undone = summary.auth_entries_undone,
                    "Rollback complete"
                );
                if summary.auth_entries_undone > 0 {
                    info!(
                        node = %self.name,
                        entries = summary.auth_entries_undone,
                        "Rollback reverted user and role changes, role graph rebuilt"
                    );
                }
                self.global_log.push(format!(
                    "rollback to {} undid {} entries ({} access control)",
                    summary.common_point, summary.undone, summary.auth_entries_undone
                ));

                let mut status = self.status.write();
                status.term = status.term.max(summary.last_applied.term);
                status.state = MemberState::Secondary;
                Ok(summary)
            }
            Err(e) => {
                error!(node = %self.name, error = %e, "Rollback failed, member is now FATAL");
                self.global_log.push(format!("rollback failed: {e}"));
                let mut status = self.status.write();
                status.state = MemberState::Fatal;
                status.voting = false;
                Err(match e {
                    WardenError::RollbackFailed(_) => e,
                    other => WardenError::RollbackFailed(other.to_string()),
                })
            }
        }
    }

    // Request dispatch

    /// Run `command` on behalf of `session`.
    pub async fn execute(
        &self,
        session: &mut AuthSession,
        peer: &PeerInfo,
        command: Command,
    ) -> Result<Reply> {
        if !self.is_running() {
            session.close();
            return Err(WardenError::ConnectionClosed);
        }
        session.ensure_open()?;
        if !matches!(command, Command::IsMaster) {
            self.check_serving()?;
        }

        let snapshot = self.storage.snapshot();
        self.authz
            .authorize_all(session, &snapshot, peer, &command.required(), command.name())?;
        if command.is_write() && !self.is_primary() {
            return Err(WardenError::NotPrimary(format!(
                "{} cannot run {} as {}",
                self.name,
                command.name(),
                self.state()
            )));
        }

        self.run(session, peer, &snapshot, command).await
    }

    fn check_serving(&self) -> Result<()> {
        match self.state() {
            MemberState::Primary | MemberState::Secondary => Ok(()),
            MemberState::Rollback | MemberState::RecoveringFromRollback => {
                Err(WardenError::RollbackInProgress)
            }
            MemberState::Fatal => Err(WardenError::RollbackFailed(format!(
                "{} is in FATAL state",
                self.name
            ))),
            MemberState::Down => Err(WardenError::ConnectionClosed),
        }
    }

    async fn run(
        &self,
        session: &mut AuthSession,
        peer: &PeerInfo,
        snapshot: &Snapshot,
        command: Command,
    ) -> Result<Reply> {
        let name = command.name();
        match command {
            Command::Authenticate(request) => self.authenticate(session, snapshot, &request, peer),
            Command::Logout { db } => Ok(Reply::LoggedOut {
                user: session.logout(&db)?,
            }),
            Command::IsMaster => Ok(Reply::IsMaster {
                is_master: self.is_primary(),
                set_name: self.config.replication.set_name.clone(),
                state: self.state(),
            }),

            Command::CreateUser {
                db,
                user,
                password,
                digest,
                roles,
                write_concern,
            } => {
                let principal = UserName::new(user, db);
                let secret = password.map(Secret::Password).unwrap_or(Secret::External);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.auth
                        .credentials()
                        .create_credential(snap, &principal, secret, digest, roles)
                })
                .await
            }
            Command::UpdateUser {
                db,
                user,
                password,
                digest,
                roles,
                write_concern,
            } => {
                let principal = UserName::new(user, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.auth.credentials().update_user(
                        snap,
                        &principal,
                        password.map(Secret::Password),
                        digest,
                        roles,
                    )
                })
                .await
            }
            Command::DropUser {
                db,
                user,
                write_concern,
            } => {
                let principal = UserName::new(user, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.auth.credentials().drop_credential(snap, &principal)
                })
                .await
            }
            Command::DropAllUsers { db, write_concern } => {
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.auth.credentials().drop_all(snap, &db)
                })
                .await
            }
            Command::UsersInfo {
                db,
                user,
                show_privileges,
            } => self.users_info(snapshot, &db, user.as_deref(), show_privileges),

            Command::CreateRole {
                db,
                role,
                privileges,
                roles,
                write_concern,
            } => {
                let role = RoleName::new(role, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.roles.create_role(snap, &role, privileges, roles)
                })
                .await
            }
            Command::GrantPrivilegesToRole {
                db,
                role,
                privileges,
                write_concern,
            } => {
                let role = RoleName::new(role, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.roles.grant_privileges_to_role(snap, &role, privileges)
                })
                .await
            }
            Command::RevokePrivilegesFromRole {
                db,
                role,
                privileges,
                write_concern,
            } => {
                let role = RoleName::new(role, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.roles.revoke_privileges_from_role(snap, &role, privileges)
                })
                .await
            }
            Command::GrantRolesToRole {
                db,
                role,
                roles,
                write_concern,
            } => {
                let role = RoleName::new(role, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.roles.grant_roles_to_role(snap, &role, roles)
                })
                .await
            }
            Command::RevokeRolesFromRole {
                db,
                role,
                roles,
                write_concern,
            } => {
                let role = RoleName::new(role, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.roles.revoke_roles_from_role(snap, &role, roles)
                })
                .await
            }
            Command::GrantRolesToUser {
                db,
                user,
                roles,
                write_concern,
            } => {
                let principal = UserName::new(user, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.roles.grant_roles_to_user(snap, &principal, roles)
                })
                .await
            }
            Command::RevokeRolesFromUser {
                db,
                user,
                roles,
                write_concern,
            } => {
                let principal = UserName::new(user, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.roles.revoke_roles_from_user(snap, &principal, roles)
                })
                .await
            }
            Command::DropRole {
                db,
                role,
                write_concern,
            } => {
                let role = RoleName::new(role, db);
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.roles.drop_role(snap, &role)
                })
                .await
            }
            Command::RolesInfo {
                db,
                role,
                show_privileges,
            } => Ok(self.roles_info(snapshot, &db, role.as_deref(), show_privileges)),

            Command::Insert {
                db,
                collection,
                documents,
                write_concern,
            } => {
                let concern = write_concern.unwrap_or(DATA_WRITE_CONCERN);
                self.insert(&db, &collection, documents, concern).await
            }
            Command::Find {
                db,
                collection,
                filter,
            } => Ok(Reply::Documents {
                documents: find(snapshot, &namespace(&db, &collection), &filter),
            }),
            Command::Count { db, collection } => Ok(Reply::Count {
                n: count(snapshot, &namespace(&db, &collection)),
            }),
            Command::DbStats { db } => Ok(db_stats(snapshot, &db)),
            Command::CollStats { db, collection } => coll_stats(snapshot, &db, &collection),
            Command::Drop {
                db,
                collection,
                write_concern,
            } => {
                let ns = namespace(&db, &collection);
                check_user_namespace(&ns)?;
                self.write(name, write_concern.unwrap_or(DATA_WRITE_CONCERN), |snap| {
                    let docs = snap
                        .catalog
                        .collection(&ns)
                        .ok_or_else(|| WardenError::NamespaceNotFound(ns.clone()))?;
                    Ok(docs
                        .iter()
                        .map(|(id, doc)| DocWrite::delete(ns.as_str(), id.as_str(), doc.clone()))
                        .collect())
                })
                .await
            }
            Command::DropDatabase { db, write_concern } => {
                self.write(name, self.auth_concern(write_concern), |snap| {
                    self.drop_database_writes(snap, &db)
                })
                .await
            }

            Command::ReplSetGetStatus => {
                let set = self.replica_set().ok_or_else(|| {
                    WardenError::InvalidOperation("not running with a replica set".into())
                })?;
                Ok(Reply::Status {
                    status: set.status(),
                })
            }
            Command::GetLog { name } => self.get_log(&name),
            Command::Eval { db, steps } => {
                let mut results = Vec::with_capacity(steps.len());
                for step in &steps {
                    results.push(self.run_step(session, peer, &db, step).await?);
                }
                Ok(Reply::Batch { results })
            }
            Command::Group {
                db,
                collection,
                key,
                side_effects,
            } => {
                let groups = group(snapshot, &namespace(&db, &collection), &key);
                for step in &side_effects {
                    self.run_step(session, peer, &db, step).await?;
                }
                Ok(Reply::Documents { documents: groups })
            }
        }
    }

    fn authenticate(
        &self,
        session: &mut AuthSession,
        snapshot: &Snapshot,
        request: &AuthRequest,
        peer: &PeerInfo,
    ) -> Result<Reply> {
        match session.authenticate(&self.auth, snapshot, request, peer) {
            Ok(user) => {
                self.global_log.push(format!(
                    "Successfully authenticated as principal {} on {}",
                    user.user, user.db
                ));
                Ok(Reply::Authenticated { user })
            }
            Err(e) => {
                self.global_log.push(format!(
                    "Failed to authenticate {}@{}: {}",
                    request.user.as_deref().unwrap_or(""),
                    request.db,
                    e.message()
                ));
                Err(e)
            }
        }
    }

    fn auth_concern(&self, requested: Option<WriteConcern>) -> WriteConcern {
        requested.unwrap_or(self.config.replication.default_write_concern)
    }

    fn replica_set(&self) -> Option<std::sync::Arc<dyn ReplicaSetControl>> {
        self.replica_set.read().as_ref().and_then(Weak::upgrade)
    }

    /// Commit the writes `plan` derives from the current snapshot as one log
    /// entry, then wait for `write_concern`.
    ///
    /// Nothing is committed when `plan` yields no writes. On a write-concern
    /// timeout the local commit stays in place.
    async fn write<F>(&self, command: &str, write_concern: WriteConcern, plan: F) -> Result<Reply>
    where
        F: FnOnce(&Snapshot) -> Result<Vec<DocWrite>>,
    {
        let entry = {
            let status = *self.status.read();
            if status.state != MemberState::Primary {
                return Err(WardenError::NotPrimary(format!(
                    "{} is {}",
                    self.name, status.state
                )));
            }
            let txn = self.storage.begin_write();
            let writes = plan(txn.snapshot())?;
            if writes.is_empty() {
                return Ok(Reply::Write {
                    position: None,
                    n: 0,
                });
            }
            txn.commit(status.term, writes)?
        };

        if entry.touches_auth() {
            info!(
                node = %self.name,
                command,
                position = %entry.position,
                writes = entry.writes.len(),
                "Access control updated"
            );
            self.global_log
                .push(format!("{command} committed at {}", entry.position));
        }

        self.replicate(&entry, write_concern).await?;
        Ok(Reply::Write {
            position: Some(entry.position),
            n: entry.writes.len(),
        })
    }

    async fn replicate(&self, entry: &LogEntry, write_concern: WriteConcern) -> Result<()> {
        let Some(set) = self.replica_set() else {
            return Ok(());
        };
        set.append_log_entry(self.id, entry)?;

        let timeout = self.config.replication.write_concern_timeout();
        let result = match write_concern {
            WriteConcern::Unacknowledged => return Ok(()),
            WriteConcern::Majority => {
                set.await_majority_ack(self.id, entry.position, timeout)
                    .await
            }
            WriteConcern::Nodes(n) => {
                set.await_acks(self.id, entry.position, n as usize, timeout)
                    .await
            }
        };

        if let Err(WardenError::WriteConcernTimeout { position, waited_ms }) = &result {
            warn!(
                node = %self.name,
                position,
                waited_ms,
                ?write_concern,
                "Write concern not satisfied, local write kept"
            );
        }
        result
    }

    async fn insert(
        &self,
        db: &str,
        collection: &str,
        documents: Vec<Document>,
        write_concern: WriteConcern,
    ) -> Result<Reply> {
        let ns = namespace(db, collection);
        check_user_namespace(&ns)?;
        self.write("insert", write_concern, |snap| {
            let mut writes: Vec<DocWrite> = Vec::with_capacity(documents.len());
            for mut doc in documents {
                let id = match doc.get("_id") {
                    Some(value) => document_id(value),
                    None => {
                        let id = uuid::Uuid::new_v4().to_string();
                        doc.insert("_id".to_string(), Value::String(id.clone()));
                        id
                    }
                };
                if snap.get(&ns, &id).is_some() || writes.iter().any(|w| w.id == id) {
                    return Err(WardenError::InvalidOperation(format!(
                        "duplicate key {id} in {ns}"
                    )));
                }
                writes.push(DocWrite::insert(ns.as_str(), id, doc));
            }
            Ok(writes)
        })
        .await
    }

    /// Authorize and run one step of an `eval` or `group` body.
    async fn run_step(
        &self,
        session: &mut AuthSession,
        peer: &PeerInfo,
        db: &str,
        step: &Step,
    ) -> Result<Reply> {
        let snapshot = self.storage.snapshot();
        let required = [step.required(db)];
        self.authz
            .authorize_all(session, &snapshot, peer, &required, step.name())?;

        match step {
            Step::Find { collection, filter } => Ok(Reply::Documents {
                documents: find(&snapshot, &namespace(db, collection), filter),
            }),
            Step::Count { collection } => Ok(Reply::Count {
                n: count(&snapshot, &namespace(db, collection)),
            }),
            Step::Insert {
                collection,
                document,
            } => {
                self.insert(db, collection, vec![document.clone()], DATA_WRITE_CONCERN)
                    .await
            }
        }
    }

    fn users_info(
        &self,
        snapshot: &Snapshot,
        db: &str,
        user: Option<&str>,
        show_privileges: bool,
    ) -> Result<Reply> {
        let store = self.auth.credentials();
        let docs = match user {
            Some(user) => store
                .get(snapshot, &UserName::new(user, db))?
                .into_iter()
                .collect(),
            None => store.list(snapshot, Some(db))?,
        };

        let users = docs
            .into_iter()
            .map(|doc| {
                let name = doc.name();
                let privileges = show_privileges.then(|| {
                    snapshot
                        .roles
                        .resolve_for_user_id(&name, &doc.user_id)
                        .to_vec()
                });
                UserInfo {
                    user: name,
                    user_id: doc.user_id,
                    external: doc.credentials.external,
                    roles: doc.roles,
                    privileges,
                }
            })
            .collect();
        Ok(Reply::Users { users })
    }

    fn roles_info(
        &self,
        snapshot: &Snapshot,
        db: &str,
        role: Option<&str>,
        show_privileges: bool,
    ) -> Reply {
        let graph = &snapshot.roles;
        let names: Vec<RoleName> = match role {
            Some(role) => vec![RoleName::new(role, db)],
            None => graph.roles_in(Some(db)).map(|n| n.name.clone()).collect(),
        };

        let roles = names
            .into_iter()
            .filter_map(|name| {
                let inherited = show_privileges
                    .then(|| graph.resolve_roles(std::slice::from_ref(&name)).to_vec());
                if let Some(builtin) = BuiltinRole::lookup(&name.role, &name.db) {
                    return Some(RoleInfo {
                        privileges: builtin.privileges(&name.db).to_vec(),
                        role: name,
                        is_builtin: true,
                        roles: Vec::new(),
                        inherited_privileges: inherited,
                    });
                }
                let node = graph.role(&name)?;
                Some(RoleInfo {
                    role: name.clone(),
                    is_builtin: false,
                    privileges: node.privileges.to_vec(),
                    roles: node.roles.clone(),
                    inherited_privileges: inherited,
                })
            })
            .collect();
        Reply::Roles { roles }
    }

    /// Deletes for every collection, principal and role of `db`.
    fn drop_database_writes(&self, snapshot: &Snapshot, db: &str) -> Result<Vec<DocWrite>> {
        let mut writes: Vec<DocWrite> = snapshot
            .catalog
            .collections_in(db)
            .map(|(collection, docs)| (namespace(db, collection), docs))
            .filter(|(ns, _)| !is_auth_namespace(ns))
            .flat_map(|(ns, docs)| {
                docs.iter()
                    .map(move |(id, doc)| DocWrite::delete(ns.as_str(), id.as_str(), doc.clone()))
            })
            .collect();

        writes.extend(self.roles.drop_all_roles(snapshot, db)?);
        // A principal being dropped needs no detach, its delete replaces it
        for delete in self.auth.credentials().drop_all(snapshot, db)? {
            writes.retain(|w| !(w.ns == delete.ns && w.id == delete.id));
            writes.push(delete);
        }
        Ok(writes)
    }

    fn get_log(&self, name: &str) -> Result<Reply> {
        let lines = match name {
            GLOBAL_LOG => self.global_log.lines(),
            STARTUP_WARNINGS_LOG => self.startup_warnings.lines(),
            "*" => vec![GLOBAL_LOG.to_string(), STARTUP_WARNINGS_LOG.to_string()],
            other => {
                return Err(WardenError::InvalidOperation(format!(
                    "no RamLog named: {other}"
                )));
            }
        };
        Ok(Reply::Lines { lines })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &*self.status.read())
            .finish_non_exhaustive()
    }
}

// Document helpers

fn check_user_namespace(ns: &str) -> Result<()> {
    if is_auth_namespace(ns) {
        return Err(WardenError::InvalidOperation(format!(
            "cannot write to {ns} directly, use the user and role commands"
        )));
    }
    Ok(())
}

fn document_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(k, v)| doc.get(k) == Some(v))
}

fn find(snapshot: &Snapshot, ns: &str, filter: &Document) -> Vec<Document> {
    snapshot
        .catalog
        .collection(ns)
        .into_iter()
        .flat_map(|docs| docs.values())
        .filter(|doc| matches_filter(doc, filter))
        .cloned()
        .collect()
}

fn count(snapshot: &Snapshot, ns: &str) -> usize {
    snapshot.catalog.collection(ns).map_or(0, |docs| docs.len())
}

fn group(snapshot: &Snapshot, ns: &str, key: &str) -> Vec<Document> {
    let mut groups: BTreeMap<String, (Value, usize)> = BTreeMap::new();
    for doc in snapshot.catalog.collection(ns).into_iter().flat_map(|d| d.values()) {
        let value = doc.get(key).cloned().unwrap_or(Value::Null);
        groups.entry(value.to_string()).or_insert((value, 0)).1 += 1;
    }
    groups
        .into_values()
        .filter_map(|(value, n)| match json!({ key: value, "count": n }) {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

fn stats(value: Value) -> Reply {
    Reply::Stats {
        stats: match value {
            Value::Object(map) => map,
            _ => Document::new(),
        },
    }
}

fn db_stats(snapshot: &Snapshot, db: &str) -> Reply {
    let (collections, objects) = snapshot
        .catalog
        .collections_in(db)
        .fold((0usize, 0usize), |(c, o), (_, docs)| (c + 1, o + docs.len()));
    stats(json!({ "db": db, "collections": collections, "objects": objects }))
}

fn coll_stats(snapshot: &Snapshot, db: &str, collection: &str) -> Result<Reply> {
    let ns = namespace(db, collection);
    let docs = snapshot
        .catalog
        .collection(&ns)
        .ok_or_else(|| WardenError::NamespaceNotFound(ns.clone()))?;
    let size: usize = docs
        .values()
        .map(|doc| serde_json::to_vec(doc).map_or(0, |bytes| bytes.len()))
        .sum();
    Ok(stats(json!({ "ns": ns, "count": docs.len(), "size": size })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DigestPolicy;
    use crate::replication::LogPosition;
    use warden_common::{
        codes,
        permissions::{Action, Privilege, ResourcePattern},
    };

    fn config(auth: bool) -> Config {
        let mut config = Config::default();
        config.auth.enabled = auth;
        config
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    async fn create_user(
        node: &Node,
        session: &mut AuthSession,
        db: &str,
        user: &str,
        roles: Vec<RoleName>,
    ) {
        node.execute(
            session,
            &PeerInfo::localhost(),
            Command::CreateUser {
                db: db.into(),
                user: user.into(),
                password: Some("pwd".into()),
                digest: DigestPolicy::Server,
                roles,
                write_concern: None,
            },
        )
        .await
        .unwrap();
    }

    async fn login(node: &Node, db: &str, user: &str) -> AuthSession {
        let mut session = AuthSession::new(Default::default());
        node.execute(
            &mut session,
            &PeerInfo::remote(),
            Command::Authenticate(AuthRequest::password(db, user, "pwd")),
        )
        .await
        .unwrap();
        session
    }

    async fn admin_session(node: &Node) -> AuthSession {
        let mut bootstrap = AuthSession::new(Default::default());
        create_user(
            node,
            &mut bootstrap,
            "admin",
            "admin",
            vec![RoleName::new("root", "admin")],
        )
        .await;
        login(node, "admin", "admin").await
    }

    #[tokio::test]
    async fn test_standalone_node_is_primary() {
        let node = Node::open(config(true), 0).unwrap();
        assert_eq!(node.state(), MemberState::Primary);
        assert_eq!(node.term(), 1);

        let mut session = AuthSession::new(Default::default());
        let reply = node
            .execute(&mut session, &PeerInfo::remote(), Command::IsMaster)
            .await
            .unwrap();
        assert!(matches!(reply, Reply::IsMaster { is_master: true, .. }));
    }

    #[tokio::test]
    async fn test_unauthenticated_commands_fail_with_code_13() {
        let node = Node::open(config(true), 0).unwrap();
        let mut session = AuthSession::new(Default::default());
        for command in [
            Command::GetLog {
                name: "global".into(),
            },
            Command::Eval {
                db: "test".into(),
                steps: vec![],
            },
            Command::DbStats { db: "test".into() },
        ] {
            let err = node
                .execute(&mut session, &PeerInfo::remote(), command)
                .await
                .unwrap_err();
            assert_eq!(err.code(), codes::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let node = Node::open(config(true), 0).unwrap();
        let mut admin = admin_session(&node).await;
        let peer = PeerInfo::remote();

        let reply = node
            .execute(
                &mut admin,
                &peer,
                Command::Insert {
                    db: "test".into(),
                    collection: "foo".into(),
                    documents: vec![doc(json!({"_id": "a", "x": 1})), doc(json!({"x": 2}))],
                    write_concern: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.count(), Some(2));

        let found = node
            .execute(
                &mut admin,
                &peer,
                Command::Find {
                    db: "test".into(),
                    collection: "foo".into(),
                    filter: doc(json!({"x": 2})),
                },
            )
            .await
            .unwrap();
        assert_eq!(found.documents().len(), 1);
        assert!(found.documents()[0].contains_key("_id"));

        let err = node
            .execute(
                &mut admin,
                &peer,
                Command::Insert {
                    db: "test".into(),
                    collection: "foo".into(),
                    documents: vec![doc(json!({"_id": "a"}))],
                    write_concern: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_OPERATION);
    }

    #[tokio::test]
    async fn test_coll_stats_checks_privileges_before_existence() {
        let node = Node::open(config(true), 0).unwrap();
        let mut admin = admin_session(&node).await;
        let peer = PeerInfo::remote();

        let mut nobody = AuthSession::new(Default::default());
        let missing = Command::CollStats {
            db: "test".into(),
            collection: "missing".into(),
        };
        let err = node
            .execute(&mut nobody, &peer, missing.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::UNAUTHORIZED);

        let err = node.execute(&mut admin, &peer, missing).await.unwrap_err();
        assert_eq!(err.code(), codes::NAMESPACE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_role_privileges_take_effect_on_existing_sessions() {
        let node = Node::open(config(true), 0).unwrap();
        let mut admin = admin_session(&node).await;
        let peer = PeerInfo::remote();

        node.execute(
            &mut admin,
            &peer,
            Command::CreateRole {
                db: "test".into(),
                role: "myRole".into(),
                privileges: vec![],
                roles: vec![],
                write_concern: None,
            },
        )
        .await
        .unwrap();
        create_user(
            &node,
            &mut admin,
            "test",
            "spencer",
            vec![RoleName::new("myRole", "test")],
        )
        .await;
        let mut spencer = login(&node, "test", "spencer").await;

        let stats = Command::DbStats { db: "test".into() };
        let err = node
            .execute(&mut spencer, &peer, stats.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::UNAUTHORIZED);

        node.execute(
            &mut admin,
            &peer,
            Command::GrantPrivilegesToRole {
                db: "test".into(),
                role: "myRole".into(),
                privileges: vec![Privilege::new(
                    ResourcePattern::database("test"),
                    [Action::DbStats],
                )],
                write_concern: None,
            },
        )
        .await
        .unwrap();
        node.execute(&mut spencer, &peer, stats).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_side_effect_write_is_refused() {
        let node = Node::open(config(true), 0).unwrap();
        let mut admin = admin_session(&node).await;
        create_user(
            &node,
            &mut admin,
            "test",
            "reader",
            vec![RoleName::new("read", "test")],
        )
        .await;
        let peer = PeerInfo::remote();

        node.execute(
            &mut admin,
            &peer,
            Command::Insert {
                db: "test".into(),
                collection: "foo".into(),
                documents: vec![doc(json!({"a": 1})), doc(json!({"a": 1})), doc(json!({"a": 2}))],
                write_concern: None,
            },
        )
        .await
        .unwrap();

        let mut reader = login(&node, "test", "reader").await;
        let read_only = Command::Group {
            db: "test".into(),
            collection: "foo".into(),
            key: "a".into(),
            side_effects: vec![],
        };
        let groups = node.execute(&mut reader, &peer, read_only).await.unwrap();
        assert_eq!(groups.documents().len(), 2);

        let with_write = Command::Group {
            db: "test".into(),
            collection: "foo".into(),
            key: "a".into(),
            side_effects: vec![Step::Insert {
                collection: "foo".into(),
                document: doc(json!({"a": 3})),
            }],
        };
        let err = node
            .execute(&mut reader, &peer, with_write)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::UNAUTHORIZED);
        assert_eq!(count(&node.snapshot(), "test.foo"), 3);
    }

    #[tokio::test]
    async fn test_drop_database_removes_users_and_roles() {
        let node = Node::open(config(true), 0).unwrap();
        let mut admin = admin_session(&node).await;
        let peer = PeerInfo::remote();

        node.execute(
            &mut admin,
            &peer,
            Command::CreateRole {
                db: "test".into(),
                role: "myRole".into(),
                privileges: vec![],
                roles: vec![],
                write_concern: None,
            },
        )
        .await
        .unwrap();
        create_user(
            &node,
            &mut admin,
            "test",
            "spencer",
            vec![RoleName::new("myRole", "test")],
        )
        .await;

        node.execute(
            &mut admin,
            &peer,
            Command::DropDatabase {
                db: "test".into(),
                write_concern: None,
            },
        )
        .await
        .unwrap();

        let snapshot = node.snapshot();
        assert!(!snapshot.roles.role_exists(&RoleName::new("myRole", "test")));
        assert!(
            node.auth
                .credentials()
                .get(&snapshot, &UserName::new("spencer", "test"))
                .unwrap()
                .is_none()
        );
        // The admin principal lives elsewhere and survives
        assert!(snapshot.has_users());
    }

    #[tokio::test]
    async fn test_get_log_records_authentication() {
        let node = Node::open(config(true), 0).unwrap();
        let mut admin = admin_session(&node).await;
        let reply = node
            .execute(
                &mut admin,
                &PeerInfo::remote(),
                Command::GetLog {
                    name: "global".into(),
                },
            )
            .await
            .unwrap();
        let Reply::Lines { lines } = reply else {
            panic!("expected log lines");
        };
        assert!(lines.iter().any(|l| l.contains("Successfully authenticated")));

        let err = node
            .execute(
                &mut admin,
                &PeerInfo::remote(),
                Command::GetLog {
                    name: "nope".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_OPERATION);
    }

    #[tokio::test]
    async fn test_secondary_rejects_writes() {
        let mut cfg = config(false);
        cfg.replication.set_name = Some("rs0".into());
        let node = Node::open(cfg, 0).unwrap();
        assert_eq!(node.state(), MemberState::Secondary);

        let mut session = AuthSession::new(Default::default());
        let err = node
            .execute(
                &mut session,
                &PeerInfo::remote(),
                Command::Insert {
                    db: "test".into(),
                    collection: "foo".into(),
                    documents: vec![Document::new()],
                    write_concern: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::NOT_PRIMARY);

        // Reads still work
        node.execute(
            &mut session,
            &PeerInfo::remote(),
            Command::Count {
                db: "test".into(),
                collection: "foo".into(),
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let node = Node::open(config(false), 0).unwrap();
        let mut session = AuthSession::new(Default::default());
        node.shutdown();
        let err = node
            .execute(&mut session, &PeerInfo::remote(), Command::IsMaster)
            .await
            .unwrap_err();
        assert_eq!(err, WardenError::ConnectionClosed);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_fatal() {
        let node = Node::open(config(false), 0).unwrap();
        let mut session = AuthSession::new(Default::default());
        node.execute(
            &mut session,
            &PeerInfo::remote(),
            Command::Insert {
                db: "test".into(),
                collection: "foo".into(),
                documents: vec![Document::new()],
                write_concern: None,
            },
        )
        .await
        .unwrap();

        // A source that checkpointed past everything this node has
        let source = LogView {
            start: LogPosition::new(5, 10),
            entries: vec![],
        };
        let err = node.rollback_to_common_point(&source).unwrap_err();
        assert_eq!(err.code(), codes::ROLLBACK_FAILED);
        assert_eq!(node.state(), MemberState::Fatal);
        assert!(!node.is_voting());

        let err = node
            .execute(
                &mut session,
                &PeerInfo::remote(),
                Command::Count {
                    db: "test".into(),
                    collection: "foo".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::ROLLBACK_FAILED);
    }

    #[tokio::test]
    async fn test_rollback_states_refuse_commands() {
        let node = Node::open(config(true), 0).unwrap();
        let mut session = AuthSession::new(Default::default());

        for state in [MemberState::Rollback, MemberState::RecoveringFromRollback] {
            node.status.write().state = state;

            // Refused before authorization is consulted
            let err = node
                .execute(
                    &mut session,
                    &PeerInfo::remote(),
                    Command::DbStats { db: "test".into() },
                )
                .await
                .unwrap_err();
            assert_eq!(err.code(), codes::ROLLBACK_IN_PROGRESS);

            let reply = node
                .execute(&mut session, &PeerInfo::remote(), Command::IsMaster)
                .await
                .unwrap();
            assert!(matches!(
                reply,
                Reply::IsMaster { is_master: false, state: s, .. } if s == state
            ));

            let err = node.become_primary(node.term() + 1).unwrap_err();
            assert_eq!(err.code(), codes::ROLLBACK_IN_PROGRESS);
        }
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_writes_require_primary() {
        let node = Node::open(config(false), 0).unwrap();
        let mut session = AuthSession::new(Default::default());
        node.step_down();
        assert_eq!(node.state(), MemberState::Secondary);

        let err = node
            .execute(
                &mut session,
                &PeerInfo::remote(),
                Command::Insert {
                    db: "test".into(),
                    collection: "foo".into(),
                    documents: vec![Document::new()],
                    write_concern: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::NOT_PRIMARY);

        let reply = node
            .execute(
                &mut session,
                &PeerInfo::remote(),
                Command::Count {
                    db: "test".into(),
                    collection: "foo".into(),
                },
            )
            .await;
        assert!(reply.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readers_never_see_half_applied_grants() {
        use std::sync::Arc;
        use warden_common::permissions::Resource;

        let node = Arc::new(Node::open(config(false), 0).unwrap());
        let mut session = AuthSession::new(Default::default());
        create_user(&node, &mut session, "test", "spencer", vec![]).await;

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let node = Arc::clone(&node);
                let stop = Arc::clone(&stop);
                tokio::spawn(async move {
                    let spencer = UserName::new("spencer", "test");
                    let mut seen = 0usize;
                    loop {
                        let snapshot = node.snapshot();
                        let privileges = snapshot.roles.resolve_effective_privileges(&spencer);
                        let on_test =
                            privileges.allows(&Resource::collection("test", "foo"), Action::Find);
                        let on_other =
                            privileges.allows(&Resource::collection("other", "foo"), Action::Find);
                        assert_eq!(on_test, on_other);

                        let stored = node
                            .auth
                            .credentials()
                            .get(&snapshot, &spencer)
                            .unwrap()
                            .unwrap();
                        assert_eq!(stored.roles.len(), if on_test { 2 } else { 0 });

                        seen += 1;
                        if stop.load(Ordering::SeqCst) {
                            break seen;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let roles = vec![RoleName::new("read", "test"), RoleName::new("read", "other")];
        for _ in 0..50 {
            node.execute(
                &mut session,
                &PeerInfo::remote(),
                Command::GrantRolesToUser {
                    db: "test".into(),
                    user: "spencer".into(),
                    roles: roles.clone(),
                    write_concern: None,
                },
            )
            .await
            .unwrap();
            node.execute(
                &mut session,
                &PeerInfo::remote(),
                Command::RevokeRolesFromUser {
                    db: "test".into(),
                    user: "spencer".into(),
                    roles: roles.clone(),
                    write_concern: None,
                },
            )
            .await
            .unwrap();
        }

        stop.store(true, Ordering::SeqCst);
        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
    }
}
