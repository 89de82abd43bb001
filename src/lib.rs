pub mod auth;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod prebuffered;
pub mod request;
pub mod response;
pub mod server;
pub mod tunnel;

pub use auth::{AuthResult, CredentialGate, Credentials};
pub use config::{ProxyConfig, Settings};
pub use error::{ConfigError, ProxyError};
pub use server::ProxyServer;
pub use tunnel::{TunnelReport, TunnelSession, TunnelState};
