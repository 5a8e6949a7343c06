//! Error definitions for Warden

use thiserror::Error;

/// Represents errors that can occur during Warden operations.
///
/// Every variant maps to a stable numeric code (see [`WardenError::code`])
/// so callers can tell authorization failures apart from data-layer errors.
///
/// # Example
/// ```rust
/// use warden_common::WardenError;
///
/// fn example() -> warden_common::Result<()> {
///     Err(WardenError::Unauthorized("not authorized on test to execute command".into()))
/// }
///
/// match example() {
///     Ok(_) => println!("Success"),
///     Err(e) => assert_eq!(e.code(), 13),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WardenError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Bad identity or bad proof. Never more specific than this.
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Duplicate principal: {0}")]
    DuplicatePrincipal(String),

    #[error("Duplicate role: {0}")]
    DuplicateRole(String),

    #[error("Cyclic role graph: {0}")]
    CyclicRoleGraph(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Already authenticated: {0}")]
    AlreadyAuthenticated(String),

    /// The mutation was applied locally but not acknowledged in time.
    #[error("Write concern timeout at {position} after {waited_ms}ms")]
    WriteConcernTimeout { position: String, waited_ms: u64 },

    #[error("Rollback in progress")]
    RollbackInProgress,

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Not primary: {0}")]
    NotPrimary(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WardenError>;

/// Numeric error codes returned to callers.
pub mod codes {
    pub const INTERNAL: u32 = 1;
    pub const INVALID_OPERATION: u32 = 2;
    pub const HOST_UNREACHABLE: u32 = 6;
    pub const FAILED_TO_PARSE: u32 = 9;
    pub const NOT_FOUND: u32 = 11;
    pub const UNAUTHORIZED: u32 = 13;
    pub const CYCLIC_ROLE_GRAPH: u32 = 17;
    pub const AUTHENTICATION_FAILED: u32 = 18;
    pub const NAMESPACE_NOT_FOUND: u32 = 26;
    pub const WRITE_CONCERN_TIMEOUT: u32 = 64;
    pub const POLICY_VIOLATION: u32 = 72;
    pub const ALREADY_AUTHENTICATED: u32 = 74;
    pub const ROLLBACK_IN_PROGRESS: u32 = 91;
    pub const ROLLBACK_FAILED: u32 = 94;
    pub const NOT_PRIMARY: u32 = 10107;
    pub const DUPLICATE_ROLE: u32 = 51002;
    pub const DUPLICATE_PRINCIPAL: u32 = 51003;
}

impl WardenError {
    /// Get the inner message without the type prefix.
    pub fn message(&self) -> &str {
        match self {
            WardenError::Io(msg)
            | WardenError::Storage(msg)
            | WardenError::Parse(msg)
            | WardenError::Config(msg)
            | WardenError::NotFound(msg)
            | WardenError::NamespaceNotFound(msg)
            | WardenError::InvalidOperation(msg)
            | WardenError::Unauthorized(msg)
            | WardenError::DuplicatePrincipal(msg)
            | WardenError::DuplicateRole(msg)
            | WardenError::CyclicRoleGraph(msg)
            | WardenError::PolicyViolation(msg)
            | WardenError::AlreadyAuthenticated(msg)
            | WardenError::RollbackFailed(msg)
            | WardenError::NotPrimary(msg) => msg,
            WardenError::WriteConcernTimeout { position, .. } => position,
            WardenError::AuthenticationFailed => "authentication failed",
            WardenError::RollbackInProgress => "rollback in progress",
            WardenError::ConnectionClosed => "connection closed",
        }
    }

    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::Io(_) => "io_error",
            WardenError::Storage(_) => "storage_error",
            WardenError::Parse(_) => "parse_error",
            WardenError::Config(_) => "config_error",
            WardenError::NotFound(_) => "not_found",
            WardenError::NamespaceNotFound(_) => "namespace_not_found",
            WardenError::InvalidOperation(_) => "invalid_operation",
            WardenError::AuthenticationFailed => "authentication_failed",
            WardenError::Unauthorized(_) => "unauthorized",
            WardenError::DuplicatePrincipal(_) => "duplicate_principal",
            WardenError::DuplicateRole(_) => "duplicate_role",
            WardenError::CyclicRoleGraph(_) => "cyclic_role_graph",
            WardenError::PolicyViolation(_) => "policy_violation",
            WardenError::AlreadyAuthenticated(_) => "already_authenticated",
            WardenError::WriteConcernTimeout { .. } => "write_concern_timeout",
            WardenError::RollbackInProgress => "rollback_in_progress",
            WardenError::RollbackFailed(_) => "rollback_failed",
            WardenError::NotPrimary(_) => "not_primary",
            WardenError::ConnectionClosed => "connection_closed",
        }
    }

    /// Numeric code reported to clients.
    pub fn code(&self) -> u32 {
        match self {
            WardenError::Io(_) | WardenError::Storage(_) | WardenError::Config(_) => {
                codes::INTERNAL
            }
            WardenError::Parse(_) => codes::FAILED_TO_PARSE,
            WardenError::NotFound(_) => codes::NOT_FOUND,
            WardenError::NamespaceNotFound(_) => codes::NAMESPACE_NOT_FOUND,
            WardenError::InvalidOperation(_) => codes::INVALID_OPERATION,
            WardenError::AuthenticationFailed => codes::AUTHENTICATION_FAILED,
            WardenError::Unauthorized(_) => codes::UNAUTHORIZED,
            WardenError::DuplicatePrincipal(_) => codes::DUPLICATE_PRINCIPAL,
            WardenError::DuplicateRole(_) => codes::DUPLICATE_ROLE,
            WardenError::CyclicRoleGraph(_) => codes::CYCLIC_ROLE_GRAPH,
            WardenError::PolicyViolation(_) => codes::POLICY_VIOLATION,
            WardenError::AlreadyAuthenticated(_) => codes::ALREADY_AUTHENTICATED,
            WardenError::WriteConcernTimeout { .. } => codes::WRITE_CONCERN_TIMEOUT,
            WardenError::RollbackInProgress => codes::ROLLBACK_IN_PROGRESS,
            WardenError::RollbackFailed(_) => codes::ROLLBACK_FAILED,
            WardenError::NotPrimary(_) => codes::NOT_PRIMARY,
            WardenError::ConnectionClosed => codes::HOST_UNREACHABLE,
        }
    }

    /// Transient errors a caller may retry after a short wait.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WardenError::RollbackInProgress | WardenError::NotPrimary(_)
        )
    }
}

/// Convert std::io::Error to WardenError
impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        WardenError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Parse(err.to_string())
    }
}
