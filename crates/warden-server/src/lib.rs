//! Warden server library
//!
//! Access control for a replicated document store: credentials and
//! sessions, the role graph and authorization engine, and a replica set
//! whose members roll back divergent writes, users and roles included.

pub mod auth;
pub mod authz;
pub mod commands;
pub mod config;
pub mod network;
pub mod node;
pub mod replication;
pub mod storage;

pub use commands::{Command, Reply};
pub use config::Config;
pub use network::Connection;
pub use node::Node;
pub use replication::{MemberSpec, ReplicaSet, WriteConcern};
