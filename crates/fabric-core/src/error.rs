//! Error types for fabric-core

use crate::context::ContextType;

/// Result type for fabric-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by network collaborators (relays, servers, signers)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Endpoint could not be reached or the exchange broke down
    #[error("Network error at {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    /// Endpoint answered but refused the request
    #[error("{endpoint} rejected the request: {reason}")]
    Rejected { endpoint: String, reason: String },

    /// Signer refused or failed to sign
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Collaborator does not implement the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Errors that can occur in fabric-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No operation with this id is tracked
    #[error("Operation not found: {id}")]
    OperationNotFound { id: String },

    /// Operation exists but cannot be cancelled
    #[error("Operation {id} is not cancelable")]
    NotCancelable { id: String },

    /// A deployment is already in progress
    #[error("Deployment {id} is already running")]
    AlreadyRunning { id: String },

    /// A context needed by a stage is missing or failed to load
    #[error("Context {context} is unavailable: {reason}")]
    ContextUnavailable { context: ContextType, reason: String },

    /// No loader registered for a context type
    #[error("No loader registered for context {context}")]
    NoLoader { context: ContextType },

    /// No signer could be resolved
    #[error("No signer available: configure a key or remote signer")]
    NoSigner,

    /// Deployment has no blob servers to transfer to
    #[error("No servers configured")]
    NoServers,

    /// The same site path was produced twice for one run
    #[error("Duplicate path in local file set: {path}")]
    DuplicatePath { path: String },

    /// Invalid deploy configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Background task ended abnormally
    #[error("Task failed: {0}")]
    Join(String),

    // Transparent wrappers for underlying errors
    /// Collaborator error
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Filesystem error from fabric-fs
    #[error(transparent)]
    Fs(#[from] fabric_fs::Error),

    /// Standard I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// TOML deserialization error
    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),
}
