//! Error types for the backend runtime.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors include sufficient detail for audit

use fabric_types::{IpPrefix, ParseError};
use thiserror::Error;

/// Errors that can occur in the backend runtime.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No constructor registered under the requested kind.
    #[error("unknown backend type: {0}")]
    UnknownBackend(String),

    /// Configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lease acquisition, renewal or watch failed.
    #[error("Lease error: {0}")]
    Lease(String),

    /// Netlink socket error
    /// NIST: SC-7 (Boundary Protection) - Kernel interface errors
    #[error("Netlink operation failed: {operation}: {message}")]
    Netlink {
        /// The operation that failed (e.g., "add_route", "dump").
        operation: String,
        /// Error message.
        message: String,
    },

    /// A route could not be derived for a destination.
    #[error("Invalid route to {destination}: {reason}")]
    InvalidRoute {
        destination: IpPrefix,
        reason: String,
    },

    /// The backend kind cannot work in this environment.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Address or prefix parsing error
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

impl BackendError {
    /// Creates a netlink error.
    pub fn netlink(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Netlink {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Creates a lease error.
    pub fn lease(message: impl Into<String>) -> Self {
        Self::Lease(message.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;
