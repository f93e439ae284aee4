//! Common types for the fabric agent.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the backend runtime, the lease model and the route table:
//!
//! - [`IpAddress`]: IPv4 and IPv6 addresses
//! - [`IpPrefix`]: IP network prefixes (CIDR notation), used for leased subnets
//!   and route destinations

mod ip;

pub use ip::{IpAddress, IpPrefix};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),
}
