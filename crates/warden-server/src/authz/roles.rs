//! Role administration.
//!
//! Every operation validates against one snapshot, including cycle checks on
//! the snapshot's role graph, and returns the writes of a single log entry.

use warden_common::{
    Result, RoleName, UserName, WardenError,
    permissions::{Privilege, PrivilegeSet},
};

use super::role_graph::{RoleDocument, RoleGraph};
use crate::auth::UserDocument;
use crate::auth::credentials::dedup_roles;
use crate::storage::{DocWrite, ROLES_NS, Snapshot, USERS_NS, from_document, to_document};

/// Role operations over the roles collection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleStore;

impl RoleStore {
    pub fn new() -> Self {
        Self
    }

    pub fn get(&self, snapshot: &Snapshot, name: &RoleName) -> Result<Option<RoleDocument>> {
        snapshot
            .get(ROLES_NS, &name.doc_id())
            .map(from_document)
            .transpose()
    }

    /// User-defined roles of `db`, or of every database.
    pub fn list(&self, snapshot: &Snapshot, db: Option<&str>) -> Result<Vec<RoleDocument>> {
        let Some(roles) = snapshot.catalog.collection(ROLES_NS) else {
            return Ok(Vec::new());
        };
        roles
            .values()
            .map(from_document::<RoleDocument>)
            .filter(|doc| match (doc, db) {
                (Ok(doc), Some(db)) => doc.db == db,
                _ => true,
            })
            .collect()
    }

    pub fn create_role(
        &self,
        snapshot: &Snapshot,
        name: &RoleName,
        privileges: Vec<Privilege>,
        roles: Vec<RoleName>,
    ) -> Result<Vec<DocWrite>> {
        if name.role.is_empty() {
            return Err(WardenError::InvalidOperation("role name cannot be empty".into()));
        }
        if RoleGraph::is_builtin(name) {
            return Err(WardenError::DuplicateRole(format!(
                "Role \"{name}\" is a built-in role"
            )));
        }
        if snapshot.roles.role(name).is_some() {
            return Err(WardenError::DuplicateRole(format!(
                "Role \"{name}\" already exists"
            )));
        }
        let roles = dedup_roles(roles);
        check_roles_exist(&snapshot.roles, &roles)?;
        check_acyclic(&snapshot.roles, name, &roles)?;

        let doc = RoleDocument::new(name, PrivilegeSet::from(privileges).to_vec(), roles);
        Ok(vec![DocWrite::insert(ROLES_NS, doc.id.clone(), to_document(&doc)?)])
    }

    pub fn grant_privileges_to_role(
        &self,
        snapshot: &Snapshot,
        name: &RoleName,
        privileges: Vec<Privilege>,
    ) -> Result<Vec<DocWrite>> {
        self.modify_role(snapshot, name, |doc| {
            let mut set = PrivilegeSet::from(std::mem::take(&mut doc.privileges));
            for privilege in privileges {
                set.add(privilege);
            }
            doc.privileges = set.to_vec();
            Ok(())
        })
    }

    pub fn revoke_privileges_from_role(
        &self,
        snapshot: &Snapshot,
        name: &RoleName,
        privileges: Vec<Privilege>,
    ) -> Result<Vec<DocWrite>> {
        self.modify_role(snapshot, name, |doc| {
            let mut set = PrivilegeSet::from(std::mem::take(&mut doc.privileges));
            for privilege in &privileges {
                set.remove(privilege);
            }
            doc.privileges = set.to_vec();
            Ok(())
        })
    }

    pub fn grant_roles_to_role(
        &self,
        snapshot: &Snapshot,
        name: &RoleName,
        roles: Vec<RoleName>,
    ) -> Result<Vec<DocWrite>> {
        check_roles_exist(&snapshot.roles, &roles)?;
        check_acyclic(&snapshot.roles, name, &roles)?;
        self.modify_role(snapshot, name, |doc| {
            let mut merged = std::mem::take(&mut doc.roles);
            merged.extend(roles);
            doc.roles = dedup_roles(merged);
            Ok(())
        })
    }

    pub fn revoke_roles_from_role(
        &self,
        snapshot: &Snapshot,
        name: &RoleName,
        roles: Vec<RoleName>,
    ) -> Result<Vec<DocWrite>> {
        self.modify_role(snapshot, name, |doc| {
            doc.roles.retain(|r| !roles.contains(r));
            Ok(())
        })
    }

    pub fn grant_roles_to_user(
        &self,
        snapshot: &Snapshot,
        user: &UserName,
        roles: Vec<RoleName>,
    ) -> Result<Vec<DocWrite>> {
        check_roles_exist(&snapshot.roles, &roles)?;
        modify_user(snapshot, user, |doc| {
            let mut merged = std::mem::take(&mut doc.roles);
            merged.extend(roles);
            doc.roles = dedup_roles(merged);
        })
    }

    pub fn revoke_roles_from_user(
        &self,
        snapshot: &Snapshot,
        user: &UserName,
        roles: Vec<RoleName>,
    ) -> Result<Vec<DocWrite>> {
        modify_user(snapshot, user, |doc| {
            doc.roles.retain(|r| !roles.contains(r));
        })
    }

    /// Remove a role and every reference to it.
    pub fn drop_role(&self, snapshot: &Snapshot, name: &RoleName) -> Result<Vec<DocWrite>> {
        if RoleGraph::is_builtin(name) {
            return Err(WardenError::InvalidOperation(format!(
                "Cannot drop built-in role \"{name}\""
            )));
        }
        let Some(existing) = snapshot.get(ROLES_NS, &name.doc_id()) else {
            return Err(WardenError::NotFound(format!("Role \"{name}\" not found")));
        };

        let mut writes = vec![DocWrite::delete(ROLES_NS, name.doc_id(), existing.clone())];
        writes.extend(detach_roles(snapshot, &[name.clone()])?);
        Ok(writes)
    }

    /// Remove every role defined in `db` and every reference to them.
    pub fn drop_all_roles(&self, snapshot: &Snapshot, db: &str) -> Result<Vec<DocWrite>> {
        let doomed: Vec<RoleName> = snapshot
            .roles
            .roles_in(Some(db))
            .map(|n| n.name.clone())
            .collect();
        let mut writes = Vec::new();
        for name in &doomed {
            if let Some(doc) = snapshot.get(ROLES_NS, &name.doc_id()) {
                writes.push(DocWrite::delete(ROLES_NS, name.doc_id(), doc.clone()));
            }
        }
        writes.extend(detach_roles(snapshot, &doomed)?);
        Ok(writes)
    }

    fn modify_role<F>(
        &self,
        snapshot: &Snapshot,
        name: &RoleName,
        change: F,
    ) -> Result<Vec<DocWrite>>
    where
        F: FnOnce(&mut RoleDocument) -> Result<()>,
    {
        if RoleGraph::is_builtin(name) {
            return Err(WardenError::InvalidOperation(format!(
                "Cannot modify built-in role \"{name}\""
            )));
        }
        let existing = self
            .get(snapshot, name)?
            .ok_or_else(|| WardenError::NotFound(format!("Role \"{name}\" not found")))?;

        let mut updated = existing.clone();
        change(&mut updated)?;
        Ok(vec![DocWrite::replace(
            ROLES_NS,
            existing.id.clone(),
            to_document(&existing)?,
            to_document(&updated)?,
        )])
    }
}

fn modify_user<F>(snapshot: &Snapshot, name: &UserName, change: F) -> Result<Vec<DocWrite>>
where
    F: FnOnce(&mut UserDocument),
{
    let Some(doc) = snapshot.get(USERS_NS, &name.doc_id()) else {
        return Err(WardenError::NotFound(format!("User \"{name}\" not found")));
    };
    let existing: UserDocument = from_document(doc)?;
    let mut updated = existing.clone();
    change(&mut updated);
    Ok(vec![DocWrite::replace(
        USERS_NS,
        existing.id.clone(),
        doc.clone(),
        to_document(&updated)?,
    )])
}

/// Writes removing `doomed` from every user and role that references them.
fn detach_roles(snapshot: &Snapshot, doomed: &[RoleName]) -> Result<Vec<DocWrite>> {
    let graph = &snapshot.roles;
    let mut writes = Vec::new();

    let mut users: Vec<&UserName> = doomed.iter().flat_map(|r| graph.members_of(r)).collect();
    users.sort();
    users.dedup();
    for user in users {
        writes.extend(modify_user(snapshot, user, |doc| {
            doc.roles.retain(|r| !doomed.contains(r));
        })?);
    }

    let mut referencing: Vec<RoleName> = doomed
        .iter()
        .flat_map(|r| graph.roles_referencing(r))
        .map(|node| node.name.clone())
        .filter(|name| !doomed.contains(name))
        .collect();
    referencing.sort();
    referencing.dedup();
    for name in referencing {
        let id = name.doc_id();
        let Some(doc) = snapshot.get(ROLES_NS, &id) else {
            continue;
        };
        let mut updated: RoleDocument = from_document(doc)?;
        updated.roles.retain(|r| !doomed.contains(r));
        writes.push(DocWrite::replace(ROLES_NS, id, doc.clone(), to_document(&updated)?));
    }

    Ok(writes)
}

fn check_roles_exist(graph: &RoleGraph, roles: &[RoleName]) -> Result<()> {
    match roles.iter().find(|r| !graph.role_exists(r)) {
        Some(missing) => Err(WardenError::NotFound(format!(
            "Role \"{missing}\" does not exist"
        ))),
        None => Ok(()),
    }
}

fn check_acyclic(graph: &RoleGraph, role: &RoleName, sub_roles: &[RoleName]) -> Result<()> {
    match graph.would_create_cycle(role, sub_roles) {
        Some(path) => {
            let path: Vec<String> = path.iter().map(|r| r.to_string()).collect();
            Err(WardenError::CyclicRoleGraph(format!(
                "granting to {role} would introduce a cycle: {}",
                path.join(" -> ")
            )))
        }
        None => Ok(()),
    }
}
