use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::config::NetworkType;

/// A single failed dial attempt during connection establishment.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub addr: SocketAddr,
    pub error: String,
}

impl fmt::Display for ConnectAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.addr, self.error)
    }
}

fn addr_list(attempts: &[ConnectAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.addr.ip().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn last_error(attempts: &[ConnectAttempt]) -> &str {
    attempts.last().map(|a| a.error.as_str()).unwrap_or("none")
}

/// Failure payload a server sends as the XOAUTH2 continuation challenge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Xoauth2Error {
    pub status: String,
    #[serde(default)]
    pub schemes: String,
    #[serde(default)]
    pub scope: String,
}

impl fmt::Display for Xoauth2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XOAUTH2 authentication error ({})", self.status)
    }
}

impl std::error::Error for Xoauth2Error {}

/// Coarse step of the check cycle an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Login,
    Validate,
    Check,
    Logout,
    Interrupted,
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("failed to resolve {server}: {source}")]
    Resolution {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no {network} addresses found for {server}")]
    NoAddresses { server: String, network: NetworkType },

    #[error(
        "failed to connect to {server} using any of {} IP addresses ({}); last error: {}",
        .attempts.len(), addr_list(.attempts), last_error(.attempts)
    )]
    Connection {
        server: String,
        attempts: Vec<ConnectAttempt>,
    },

    #[error("TLS setup for {server} failed: {reason}")]
    Tls { server: String, reason: String },

    #[error("failed to query capabilities of {server}: {reason}")]
    Capability { server: String, reason: String },

    #[error("{server} advertises LOGINDISABLED; refusing plaintext login")]
    LoginDisabled { server: String },

    #[error("{account}: login failed: {reason}")]
    Auth { account: String, reason: String },

    #[error("{account}: failed to acquire OAuth2 token: {source}")]
    TokenAcquisition {
        account: String,
        #[source]
        source: crate::oauth::TokenError,
    },

    #[error("{server} does not advertise AUTH={mechanism}")]
    UnsupportedMechanism {
        server: String,
        mechanism: &'static str,
    },

    #[error("{account}: {source}")]
    Xoauth2 {
        account: String,
        #[source]
        source: Xoauth2Error,
    },

    #[error("{account}: failed to list mailboxes: {source}")]
    List {
        account: String,
        #[source]
        source: async_imap::error::Error,
    },

    #[error("{account}: mailbox not found: {folder:?}")]
    FolderNotFound { account: String, folder: String },

    #[error("{account}: failed to select mailbox {folder:?}: {source}")]
    Select {
        account: String,
        folder: String,
        #[source]
        source: async_imap::error::Error,
    },

    #[error("{account}: failed to fetch messages from {folder:?}: {source}")]
    Fetch {
        account: String,
        folder: String,
        #[source]
        source: async_imap::error::Error,
    },

    #[error("{account}: expected {expected} message(s) from {folder:?} but the server returned {got}")]
    IncompleteFetch {
        account: String,
        folder: String,
        expected: u32,
        got: u32,
    },

    #[error("{account}: failed to log out: {reason}")]
    Logout { account: String, reason: String },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

impl CheckError {
    pub fn stage(&self) -> Stage {
        match self {
            CheckError::Resolution { .. }
            | CheckError::NoAddresses { .. }
            | CheckError::Connection { .. }
            | CheckError::Tls { .. } => Stage::Connect,
            CheckError::Capability { .. }
            | CheckError::LoginDisabled { .. }
            | CheckError::Auth { .. }
            | CheckError::TokenAcquisition { .. }
            | CheckError::UnsupportedMechanism { .. }
            | CheckError::Xoauth2 { .. } => Stage::Login,
            CheckError::List { .. } | CheckError::FolderNotFound { .. } => Stage::Validate,
            CheckError::Select { .. }
            | CheckError::Fetch { .. }
            | CheckError::IncompleteFetch { .. } => Stage::Check,
            CheckError::Logout { .. } => Stage::Logout,
            CheckError::Timeout { .. } | CheckError::Cancelled { .. } => Stage::Interrupted,
        }
    }
}
