use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect to upstream {target}: {source}")]
    UpstreamConnect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Upstream {0} did not answer in time")]
    UpstreamTimeout(String),

    #[error("URI error: {0}")]
    Uri(String),
}

/// Startup configuration problems. All of them are fatal and are reported
/// before any socket is bound.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration values: {}", .0.join(", "))]
    MissingValues(Vec<&'static str>),

    #[error("{0} is not a valid port number")]
    InvalidPort(String),

    #[error("proxyUser is defined but proxyPassword is missing")]
    PasswordMissing,

    #[error("proxyUser and proxyPassword must not be empty")]
    EmptyCredential,

    #[error("Invalid proxy target '{value}': {reason}")]
    InvalidTarget { value: String, reason: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Failed to load config file {path}: {reason}")]
    File { path: String, reason: String },
}

impl ConfigError {
    /// Process exit code for this error: 1 when something is missing,
    /// 2 when something is present but wrong.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::MissingValues(_) => 1,
            _ => 2,
        }
    }
}

/// Failure to read the first request head off a client connection.
#[derive(Error, Debug)]
pub enum HeadError {
    #[error("connection closed before the request head was complete")]
    Closed,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request head: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Which end of a tunnel an I/O fault happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Upstream,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Client => write!(f, "client"),
            Peer::Upstream => write!(f, "upstream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => write!(f, "read from"),
            IoOp::Write => write!(f, "write to"),
        }
    }
}

/// Fault inside an established tunnel.
#[derive(Error, Debug)]
#[error("failed to {op} {peer}: {source}")]
pub struct TransportError {
    pub peer: Peer,
    pub op: IoOp,
    #[source]
    pub source: io::Error,
}

impl TransportError {
    pub fn new(peer: Peer, op: IoOp, source: io::Error) -> Self {
        Self { peer, op, source }
    }

    /// True when the client went away abruptly. These are routine for a
    /// proxy and are not reported as failures.
    pub fn is_client_disconnect(&self) -> bool {
        self.peer == Peer::Client
            && matches!(
                self.source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
    }
}
