//! Basic authentication gate shared by the tunnel and forwarding paths.

use crate::config::ProxyConfig;
use crate::error::ConfigError;
use base64::{Engine as _, engine::general_purpose};
use http::HeaderValue;
use std::fmt;
use zeroize::Zeroizing;

/// The single username/password pair the proxy accepts.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        let username = username.into();
        let password = Zeroizing::new(password.into());
        if username.is_empty() || password.is_empty() {
            return Err(ConfigError::EmptyCredential);
        }
        Ok(Self { username, password })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password.as_str() == password
    }

    /// Encodes the pair as an `Authorization` header value.
    pub fn to_header_value(&self) -> String {
        let raw = Zeroizing::new(format!("{}:{}", self.username, self.password.as_str()));
        format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Allowed,
    MissingCredentials,
    InvalidCredentials,
}

/// Authentication strategy, chosen once from the configuration.
#[derive(Debug, Clone)]
pub enum CredentialGate {
    /// No credential configured; everything is admitted.
    Open,
    Basic(Credentials),
}

impl CredentialGate {
    pub fn from_config(config: &ProxyConfig) -> Self {
        match &config.credential {
            Some(credential) => CredentialGate::Basic(credential.clone()),
            None => CredentialGate::Open,
        }
    }

    pub fn evaluate(&self, header: Option<&HeaderValue>) -> AuthResult {
        let CredentialGate::Basic(expected) = self else {
            return AuthResult::Allowed;
        };
        let Some(header) = header else {
            return AuthResult::MissingCredentials;
        };
        match decode_basic(header) {
            Some((username, password)) if expected.matches(&username, &password) => {
                AuthResult::Allowed
            }
            _ => AuthResult::InvalidCredentials,
        }
    }

    /// Username carried by a header, for denial logs. Never the password.
    pub fn claimed_user(header: Option<&HeaderValue>) -> Option<String> {
        header.and_then(decode_basic).map(|(username, _)| username)
    }
}

/// Evaluates an `Authorization`/`Proxy-Authorization` value against the
/// configured credential.
pub fn evaluate(header: Option<&HeaderValue>, config: &ProxyConfig) -> AuthResult {
    CredentialGate::from_config(config).evaluate(header)
}

fn decode_basic(header: &HeaderValue) -> Option<(String, Zeroizing<String>)> {
    let value = header.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = Zeroizing::new(general_purpose::STANDARD.decode(encoded.trim()).ok()?);
    let credentials = std::str::from_utf8(&decoded).ok()?;
    let (username, password) = credentials.split_once(':')?;
    Some((username.to_string(), Zeroizing::new(password.to_string())))
}
