//! Error types for every component.
//!
//! Each component reports failures through its own enum so that callers can
//! decide locally whether to retry, drop, or give up.  Only the startup
//! sequence in `main` turns an error into process termination.

use thiserror::Error;

/// Address literal could not be interpreted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("invalid IPv4 address: {0}")]
    InvalidIpv4(String),
    #[error("IPv6 addresses are not supported: {0}")]
    Ipv6(String),
    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),
    #[error("invalid domain name: {0}")]
    InvalidDomain(String),
}

/// An inbound frame that cannot become an [`Event`](crate::types::Event).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message carries an empty address")]
    EmptyAddress,
}

/// Failure of a single enforcement primitive.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("injected failure for {primitive} on {address}")]
    Injected { primitive: String, address: String },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("entry {0} is immutable")]
    Immutable(String),
    #[error("registry I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("registry snapshot is corrupt: {0}")]
    Snapshot(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("DNS lookup for {domain} failed: {reason}")]
    Lookup { domain: String, reason: String },
    #[error("no IPv4 addresses found for {0}")]
    NoAddresses(String),
}

/// Rejection of a control-plane submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0} is immutable and cannot be deleted")]
    Immutable(String),
    #[error("submission action must be add or delete")]
    UnsupportedAction,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Agent preconditions that must hold before reconciliation starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("IPv4 forwarding is disabled on this host")]
    ForwardingDisabled,
    #[error("could not check IPv4 forwarding: {0}")]
    ForwardingCheck(#[source] FilterError),
    #[error("failed to install reserved range allow rules: {0}")]
    ReservedRanges(#[source] FilterError),
    #[error("failed to set FORWARD policy to ACCEPT: {0}")]
    ForwardPolicy(#[source] FilterError),
    #[error("failed to install catch-all deny rules: {0}")]
    CatchAllDeny(#[source] FilterError),
}
