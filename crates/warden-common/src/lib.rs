//! Common library for Warden
//!
//! This crate provides the vocabulary shared by every Warden component.
//!
//! Modules:
//! * `error`: Defines error types and numeric error codes.
//! * `identity`: Defines principal and role identities.
//! * `permissions`: Defines actions, resource patterns, privileges and built-in roles.

pub mod error;
pub mod identity;
pub mod permissions;

// Re-export commonly used types at the base
pub use error::*;
pub use identity::{ADMIN_DB, EXTERNAL_DB, RoleName, UserName};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
