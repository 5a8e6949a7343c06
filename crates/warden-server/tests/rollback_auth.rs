//! User and role changes that never reached a majority are rolled back
//! together with data, and the rolled-back member's privileges converge
//! with the new primary's.

use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::tempdir;
use warden_common::{
    RoleName, UserName, codes,
    permissions::{Action, Privilege, Resource, ResourcePattern},
};
use warden_server::auth::{AuthRequest, AuthSession, DigestPolicy, PeerInfo};
use warden_server::replication::{MemberState, ReplicaSetControl};
use warden_server::storage::Document;
use warden_server::{Command, Config, MemberSpec, Node, ReplicaSet, Reply, WriteConcern};

fn template() -> Config {
    let mut config = Config::default();
    config.replication.write_concern_timeout_ms = 200;
    config
}

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn foo(actions: impl IntoIterator<Item = Action>) -> Vec<Privilege> {
    vec![Privilege::new(ResourcePattern::collection("test", "foo"), actions)]
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

async fn insert(node: &Node, session: &mut AuthSession, x: i64) -> warden_common::Result<Reply> {
    node.execute(
        session,
        &PeerInfo::remote(),
        Command::Insert {
            db: "test".into(),
            collection: "foo".into(),
            documents: vec![doc(json!({ "x": x }))],
            write_concern: Some(WriteConcern::Unacknowledged),
        },
    )
    .await
}

async fn grant(node: &Node, admin: &mut AuthSession, actions: impl IntoIterator<Item = Action>) {
    node.execute(
        admin,
        &PeerInfo::remote(),
        Command::GrantPrivilegesToRole {
            db: "test".into(),
            role: "myRole".into(),
            privileges: foo(actions),
            write_concern: Some(WriteConcern::Unacknowledged),
        },
    )
    .await
    .unwrap();
}

async fn setup(set: &ReplicaSet) -> Arc<Node> {
    set.elect(0).unwrap();
    let a = set.primary().unwrap();

    let mut local = AuthSession::new(Default::default());
    a.execute(
        &mut local,
        &PeerInfo::localhost(),
        Command::CreateUser {
            db: "admin".into(),
            user: "admin".into(),
            password: Some("pwd".into()),
            digest: DigestPolicy::Server,
            roles: vec![RoleName::new("root", "admin")],
            write_concern: None,
        },
    )
    .await
    .unwrap();

    let mut admin = login(&a, "admin", "admin").await;
    let peer = PeerInfo::remote();
    a.execute(
        &mut admin,
        &peer,
        Command::CreateRole {
            db: "test".into(),
            role: "myRole".into(),
            privileges: foo([Action::Find]),
            roles: vec![],
            write_concern: None,
        },
    )
    .await
    .unwrap();
    a.execute(
        &mut admin,
        &peer,
        Command::CreateUser {
            db: "test".into(),
            user: "spencer".into(),
            password: Some("pwd".into()),
            digest: DigestPolicy::Server,
            roles: vec![RoleName::new("myRole", "test")],
            write_concern: None,
        },
    )
    .await
    .unwrap();
    insert(&a, &mut admin, 1).await.unwrap();
    set.await_replication(std::time::Duration::from_secs(1))
        .await
        .unwrap();
    a
}

#[tokio::test]
async fn test_rolled_back_grants_converge() {
    let dir = tempdir().unwrap();
    let set = ReplicaSet::start(
        "rs0",
        &[MemberSpec::data(), MemberSpec::data(), MemberSpec::arbiter()],
        &template(),
        Some(dir.path()),
    )
    .unwrap();
    let spencer = UserName::new("spencer", "test");
    let foo_coll = Resource::collection("test", "foo");

    let a = setup(&set).await;
    let mut spencer_on_a = login(&a, "test", "spencer").await;
    assert_eq!(
        insert(&a, &mut spencer_on_a, 2).await.unwrap_err().code(),
        codes::UNAUTHORIZED
    );

    // A takes grants and data that B never sees
    set.stop(1);
    let mut admin = login(&a, "admin", "admin").await;
    grant(&a, &mut admin, [Action::Insert]).await;
    insert(&a, &mut spencer_on_a, 2).await.unwrap();
    assert!(a.effective_privileges(&spencer).allows(&foo_coll, Action::Insert));

    set.stop(0);
    drop(a);

    // B becomes primary and diverges
    set.restart(1).unwrap();
    set.elect(1).unwrap();
    let b = set.primary().unwrap();
    let mut admin = login(&b, "admin", "admin").await;
    grant(&b, &mut admin, [Action::Remove]).await;
    b.execute(
        &mut admin,
        &PeerInfo::remote(),
        Command::CreateRole {
            db: "test".into(),
            role: "otherRole".into(),
            privileges: vec![],
            roles: vec![],
            write_concern: Some(WriteConcern::Unacknowledged),
        },
    )
    .await
    .unwrap();

    // A rejoins and rolls back
    let a = set.restart(0).unwrap().unwrap();
    assert_eq!(a.state(), MemberState::Secondary);
    assert_eq!(a.storage().last_position(), b.storage().last_position());
    assert_eq!(a.effective_privileges(&spencer), b.effective_privileges(&spencer));

    let privileges = a.effective_privileges(&spencer);
    assert!(privileges.allows(&foo_coll, Action::Find));
    assert!(privileges.allows(&foo_coll, Action::Remove));
    assert!(!privileges.allows(&foo_coll, Action::Insert));
    assert!(a.snapshot().roles.role_exists(&RoleName::new("otherRole", "test")));

    // The insert made under the rolled-back grant is gone too
    let mut spencer_on_a = login(&a, "test", "spencer").await;
    let count = a
        .execute(
            &mut spencer_on_a,
            &PeerInfo::remote(),
            Command::Count {
                db: "test".into(),
                collection: "foo".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(count.count(), Some(1));
    assert_eq!(
        insert(&a, &mut spencer_on_a, 3).await.unwrap_err().code(),
        codes::UNAUTHORIZED
    );

    let mut admin_on_a = login(&a, "admin", "admin").await;
    let reply = a
        .execute(
            &mut admin_on_a,
            &PeerInfo::remote(),
            Command::GetLog { name: "global".into() },
        )
        .await
        .unwrap();
    let Reply::Lines { lines } = reply else {
        panic!("expected log lines");
    };
    assert!(lines.iter().any(|line| line.starts_with("rollback to")));
}

#[tokio::test]
async fn test_member_without_common_point_goes_fatal() {
    let dir = tempdir().unwrap();
    let set = ReplicaSet::start(
        "rs0",
        &[MemberSpec::data(), MemberSpec::data(), MemberSpec::arbiter()],
        &template(),
        Some(dir.path()),
    )
    .unwrap();
    let a = setup(&set).await;

    set.stop(1);
    let mut admin = login(&a, "admin", "admin").await;
    grant(&a, &mut admin, [Action::Insert]).await;
    set.stop(0);
    drop(a);

    // B folds its log into a checkpoint past the point where A diverged
    set.restart(1).unwrap();
    set.elect(1).unwrap();
    let b = set.primary().unwrap();
    let mut admin = login(&b, "admin", "admin").await;
    grant(&b, &mut admin, [Action::Remove]).await;
    b.storage().checkpoint().unwrap();

    let a = set.restart(0).unwrap().unwrap();
    assert_eq!(a.state(), MemberState::Fatal);
    assert!(!a.is_voting());

    let mut session = AuthSession::new(Default::default());
    let err = a
        .execute(
            &mut session,
            &PeerInfo::remote(),
            Command::Authenticate(AuthRequest::password("test", "spencer", "pwd")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::ROLLBACK_FAILED);

    let status = set.status();
    assert_eq!(status.members[0].state, MemberState::Fatal);
    assert!(!status.members[0].voting);
    assert!(set.elect(0).is_err());

    // The healthy members still form a majority
    grant(&b, &mut admin, [Action::Update]).await;
    set.elect(1).unwrap();
}
