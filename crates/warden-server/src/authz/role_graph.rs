//! Role graph derived from the users and roles collections.
//!
//! The graph is an immutable value rebuilt copy-on-write whenever a log entry
//! touches access-control documents. Nodes sit behind `Arc`, so a new graph
//! shares every node the entry did not change. Each graph carries a
//! generation number; sessions key their privilege caches on it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use warden_common::{
    RoleName, UserName,
    permissions::{BuiltinRole, Privilege, PrivilegeSet},
};

use crate::auth::UserDocument;
use crate::storage::{Catalog, DocWrite, Document, ROLES_NS, USERS_NS, from_document};

/// A user-defined role as stored in the roles collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDocument {
    /// `<db>.<role>`
    #[serde(rename = "_id")]
    pub id: String,
    pub role: String,
    pub db: String,
    #[serde(default)]
    pub privileges: Vec<Privilege>,
    #[serde(default)]
    pub roles: Vec<RoleName>,
}

impl RoleDocument {
    pub fn new(name: &RoleName, privileges: Vec<Privilege>, roles: Vec<RoleName>) -> Self {
        Self {
            id: name.doc_id(),
            role: name.role.clone(),
            db: name.db.clone(),
            privileges,
            roles,
        }
    }

    pub fn name(&self) -> RoleName {
        RoleName::new(&self.role, &self.db)
    }
}

/// A user-defined role.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleNode {
    pub name: RoleName,
    pub privileges: PrivilegeSet,
    /// Directly inherited roles
    pub roles: Vec<RoleName>,
    /// Graph generation at which the node last changed
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UserGrants {
    user_id: String,
    roles: Vec<RoleName>,
}

#[derive(Debug, Clone, Default)]
pub struct RoleGraph {
    generation: u64,
    roles: BTreeMap<RoleName, Arc<RoleNode>>,
    users: BTreeMap<UserName, Arc<UserGrants>>,
    /// Principals directly granted each role
    members: BTreeMap<RoleName, BTreeSet<UserName>>,
}

impl RoleGraph {
    /// Build the graph from the access-control collections of `catalog`.
    pub fn from_catalog(catalog: &Catalog, generation: u64) -> Self {
        let mut graph = RoleGraph {
            generation,
            ..Default::default()
        };
        for doc in catalog.collection(ROLES_NS).into_iter().flat_map(|c| c.values()) {
            graph.put_role(doc);
        }
        for doc in catalog.collection(USERS_NS).into_iter().flat_map(|c| c.values()) {
            graph.put_user(doc);
        }
        graph
    }

    /// A copy of this graph with `writes` applied.
    pub fn with_writes(&self, writes: &[DocWrite], generation: u64) -> Self {
        let mut graph = self.clone();
        graph.generation = generation;
        for write in writes {
            match write.ns.as_str() {
                ROLES_NS => {
                    if let Some(before) = &write.before {
                        graph.remove_role(before);
                    }
                    if let Some(after) = &write.after {
                        graph.put_role(after);
                    }
                }
                USERS_NS => {
                    if let Some(before) = &write.before {
                        graph.remove_user(before);
                    }
                    if let Some(after) = &write.after {
                        graph.put_user(after);
                    }
                }
                _ => {}
            }
        }
        graph
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self, name: &RoleName) -> Option<&RoleNode> {
        self.roles.get(name).map(|node| node.as_ref())
    }

    pub fn is_builtin(name: &RoleName) -> bool {
        BuiltinRole::lookup(&name.role, &name.db).is_some()
    }

    /// Whether the role is built in or defined.
    pub fn role_exists(&self, name: &RoleName) -> bool {
        Self::is_builtin(name) || self.roles.contains_key(name)
    }

    /// User-defined roles of `db`, or of every database.
    pub fn roles_in<'a>(&'a self, db: Option<&'a str>) -> impl Iterator<Item = &'a RoleNode> + 'a {
        self.roles
            .values()
            .filter(move |node| db.is_none_or(|db| node.name.db == db))
            .map(|node| node.as_ref())
    }

    /// Roles granted directly to `user`.
    pub fn direct_roles(&self, user: &UserName) -> &[RoleName] {
        self.users
            .get(user)
            .map(|grants| grants.roles.as_slice())
            .unwrap_or(&[])
    }

    /// Principals directly granted `role`.
    pub fn members_of(&self, role: &RoleName) -> impl Iterator<Item = &UserName> {
        self.members.get(role).into_iter().flat_map(|m| m.iter())
    }

    /// User-defined roles that directly inherit `role`.
    pub fn roles_referencing<'a>(
        &'a self,
        role: &'a RoleName,
    ) -> impl Iterator<Item = &'a RoleNode> + 'a {
        self.roles
            .values()
            .filter(move |node| node.roles.contains(role))
            .map(|node| node.as_ref())
    }

    /// The path that would close a cycle if `role` inherited `sub_roles`.
    pub fn would_create_cycle(
        &self,
        role: &RoleName,
        sub_roles: &[RoleName],
    ) -> Option<Vec<RoleName>> {
        for sub in sub_roles {
            if sub == role {
                return Some(vec![role.clone(), role.clone()]);
            }
            if let Some(mut path) = self.path_between(sub, role) {
                path.insert(0, role.clone());
                return Some(path);
            }
        }
        None
    }

    /// Depth-first search over sub-role edges from `from` to `to`.
    fn path_between(&self, from: &RoleName, to: &RoleName) -> Option<Vec<RoleName>> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![vec![from.clone()]];
        while let Some(path) = stack.pop() {
            let Some(current) = path.last() else {
                continue;
            };
            if current == to {
                return Some(path);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.roles.get(current) {
                for next in node.roles.iter().rev() {
                    let mut extended = path.clone();
                    extended.push(next.clone());
                    stack.push(extended);
                }
            }
        }
        None
    }

    /// Every role reachable from `roles`, themselves included.
    pub fn role_closure(&self, roles: &[RoleName]) -> BTreeSet<RoleName> {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<RoleName> = roles.iter().rev().cloned().collect();
        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(node) = self.roles.get(&name) {
                stack.extend(node.roles.iter().rev().cloned());
            }
        }
        visited
    }

    /// Union of the privileges of `roles` and everything they inherit.
    ///
    /// Unknown roles contribute nothing.
    pub fn resolve_roles(&self, roles: &[RoleName]) -> PrivilegeSet {
        let mut privileges = PrivilegeSet::new();
        for name in self.role_closure(roles) {
            if let Some(builtin) = BuiltinRole::lookup(&name.role, &name.db) {
                privileges.merge(&builtin.privileges(&name.db));
            } else if let Some(node) = self.roles.get(&name) {
                privileges.merge(&node.privileges);
            }
        }
        privileges
    }

    pub fn resolve_effective_privileges(&self, user: &UserName) -> PrivilegeSet {
        self.resolve_roles(self.direct_roles(user))
    }

    /// Effective privileges of `user`, provided the stored principal is still
    /// the one with `user_id`. A dropped and re-created principal does not
    /// hand its grants to sessions of the old one.
    pub fn resolve_for_user_id(&self, user: &UserName, user_id: &str) -> PrivilegeSet {
        match self.users.get(user) {
            Some(grants) if grants.user_id == user_id => self.resolve_roles(&grants.roles),
            _ => PrivilegeSet::new(),
        }
    }

    fn put_role(&mut self, doc: &Document) {
        match from_document::<RoleDocument>(doc) {
            Ok(role) => {
                let name = role.name();
                let node = RoleNode {
                    name: name.clone(),
                    privileges: role.privileges.into(),
                    roles: role.roles,
                    generation: self.generation,
                };
                self.roles.insert(name, Arc::new(node));
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed role document"),
        }
    }

    fn remove_role(&mut self, doc: &Document) {
        if let Ok(role) = from_document::<RoleDocument>(doc) {
            self.roles.remove(&role.name());
        }
    }

    fn put_user(&mut self, doc: &Document) {
        match from_document::<UserDocument>(doc) {
            Ok(user) => {
                let name = user.name();
                for role in &user.roles {
                    self.members.entry(role.clone()).or_default().insert(name.clone());
                }
                self.users.insert(
                    name,
                    Arc::new(UserGrants {
                        user_id: user.user_id,
                        roles: user.roles,
                    }),
                );
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed user document"),
        }
    }

    fn remove_user(&mut self, doc: &Document) {
        let Ok(user) = from_document::<UserDocument>(doc) else {
            return;
        };
        let name = user.name();
        if let Some(grants) = self.users.remove(&name) {
            for role in &grants.roles {
                if let Some(members) = self.members.get_mut(role) {
                    members.remove(&name);
                    if members.is_empty() {
                        self.members.remove(role);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::storage::to_document;
    use pretty_assertions::assert_eq;
    use warden_common::permissions::{Action, Resource, ResourcePattern};

    fn role_write(name: &RoleName, privileges: Vec<Privilege>, roles: Vec<RoleName>) -> DocWrite {
        let doc = RoleDocument::new(name, privileges, roles);
        DocWrite::insert(ROLES_NS, doc.id.clone(), to_document(&doc).unwrap())
    }

    fn user_doc(name: &UserName, user_id: &str, roles: Vec<RoleName>) -> UserDocument {
        UserDocument {
            id: name.doc_id(),
            user_id: user_id.to_string(),
            user: name.user.clone(),
            db: name.db.clone(),
            credentials: Credentials::default(),
            roles,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn user_write(name: &UserName, roles: Vec<RoleName>) -> DocWrite {
        let doc = user_doc(name, "uid", roles);
        DocWrite::insert(USERS_NS, doc.id.clone(), to_document(&doc).unwrap())
    }

    fn graph(writes: Vec<DocWrite>) -> RoleGraph {
        let mut catalog = Catalog::new();
        for write in &writes {
            catalog.apply(write);
        }
        RoleGraph::from_catalog(&catalog, 1)
    }

    fn db_stats(db: &str) -> Privilege {
        Privilege::new(ResourcePattern::database(db), [Action::DbStats])
    }

    #[test]
    fn test_transitive_resolution() {
        let base = RoleName::new("base", "test");
        let mid = RoleName::new("mid", "test");
        let top = RoleName::new("top", "test");
        let user = UserName::new("spencer", "test");

        let graph = graph(vec![
            role_write(&base, vec![db_stats("test")], vec![]),
            role_write(
                &mid,
                vec![Privilege::new(
                    ResourcePattern::collection("test", "foo"),
                    [Action::CollStats],
                )],
                vec![base.clone()],
            ),
            role_write(&top, vec![], vec![mid.clone(), RoleName::new("read", "other")]),
            user_write(&user, vec![top.clone()]),
        ]);

        let privileges = graph.resolve_effective_privileges(&user);
        assert!(privileges.allows(&Resource::database("test"), Action::DbStats));
        assert!(privileges.allows(&Resource::collection("test", "foo"), Action::CollStats));
        assert!(privileges.allows(&Resource::collection("other", "x"), Action::Find));
        assert!(!privileges.allows(&Resource::collection("test", "foo"), Action::Find));

        assert_eq!(
            graph.role_closure(&[top.clone()]),
            [base, mid, top, RoleName::new("read", "other")].into_iter().collect()
        );
    }

    #[test]
    fn test_default_deny_for_unknown_principal() {
        let graph = graph(vec![]);
        assert!(graph.resolve_effective_privileges(&UserName::new("nobody", "test")).is_empty());
    }

    #[test]
    fn test_diamond_is_deduplicated_and_deterministic() {
        let shared = RoleName::new("shared", "test");
        let left = RoleName::new("left", "test");
        let right = RoleName::new("right", "test");
        let user = UserName::new("spencer", "test");

        let a = graph(vec![
            role_write(&shared, vec![db_stats("test")], vec![]),
            role_write(&left, vec![], vec![shared.clone()]),
            role_write(&right, vec![], vec![shared.clone()]),
            user_write(&user, vec![left.clone(), right.clone()]),
        ]);
        let b = graph(vec![
            user_write(&user, vec![right, left]),
            role_write(&shared, vec![db_stats("test")], vec![]),
            role_write(&RoleName::new("left", "test"), vec![], vec![shared.clone()]),
            role_write(&RoleName::new("right", "test"), vec![], vec![shared]),
        ]);

        let pa = a.resolve_effective_privileges(&user);
        let pb = b.resolve_effective_privileges(&user);
        assert_eq!(pa, pb);
        assert_eq!(pa.len(), 1);
        assert_eq!(serde_json::to_string(&pa).unwrap(), serde_json::to_string(&pb).unwrap());
    }

    #[test]
    fn test_cycle_detection() {
        let a = RoleName::new("a", "test");
        let b = RoleName::new("b", "test");
        let c = RoleName::new("c", "test");
        let graph = graph(vec![
            role_write(&a, vec![], vec![b.clone()]),
            role_write(&b, vec![], vec![c.clone()]),
            role_write(&c, vec![], vec![]),
        ]);

        assert_eq!(
            graph.would_create_cycle(&c, &[a.clone()]),
            Some(vec![c.clone(), a.clone(), b.clone(), c.clone()])
        );
        assert_eq!(graph.would_create_cycle(&a, &[a.clone()]), Some(vec![a.clone(), a.clone()]));
        assert_eq!(graph.would_create_cycle(&a, &[c.clone()]), None);
        assert_eq!(graph.would_create_cycle(&RoleName::new("d", "test"), &[a]), None);
    }

    #[test]
    fn test_members_index_follows_user_writes() {
        let role = RoleName::new("myRole", "test");
        let user = UserName::new("spencer", "test");
        let g1 = graph(vec![role_write(&role, vec![], vec![])]);
        assert_eq!(g1.members_of(&role).count(), 0);

        let g2 = g1.with_writes(&[user_write(&user, vec![role.clone()])], 2);
        assert_eq!(g2.members_of(&role).collect::<Vec<_>>(), vec![&user]);
        assert_eq!(g2.generation(), 2);
        // The old graph is untouched
        assert_eq!(g1.members_of(&role).count(), 0);

        let doc = to_document(&user_doc(&user, "uid", vec![role.clone()])).unwrap();
        let g3 = g2.with_writes(&[DocWrite::delete(USERS_NS, user.doc_id(), doc)], 3);
        assert_eq!(g3.members_of(&role).count(), 0);
        assert!(g3.resolve_effective_privileges(&user).is_empty());
    }

    #[test]
    fn test_recreated_principal_does_not_inherit_sessions() {
        let user = UserName::new("spencer", "test");
        let graph = graph(vec![user_write(&user, vec![RoleName::new("read", "test")])]);
        assert!(!graph.resolve_for_user_id(&user, "uid").is_empty());
        assert!(graph.resolve_for_user_id(&user, "stale-uid").is_empty());
    }

    #[test]
    fn test_builtin_roles_exist_implicitly() {
        let graph = RoleGraph::default();
        assert!(graph.role_exists(&RoleName::new("readWrite", "test")));
        assert!(graph.role_exists(&RoleName::new("__system", "admin")));
        assert!(!graph.role_exists(&RoleName::new("root", "test")));
        assert!(!graph.role_exists(&RoleName::new("myRole", "test")));
    }
}
