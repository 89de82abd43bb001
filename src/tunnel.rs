//! CONNECT tunnels.
//!
//! A [`TunnelSession`] walks `Pending -> Authenticating -> Connecting ->
//! Established -> Closed`, or ends in `Failed` after writing an error
//! response. It owns both sockets; whenever the session returns, both are
//! dropped, so neither side can outlive the other.

use crate::auth::{AuthResult, CredentialGate};
use crate::config::ProxyConfig;
use crate::error::{IoOp, Peer, ProxyError, TransportError};
use crate::request::RequestHead;
use crate::response::{self, raw};
use bytes::Bytes;
use futures::future::{self, Either};
use http::header::PROXY_AUTHORIZATION;
use log::{debug, error, info, warn};
use std::fmt;
use std::pin::pin;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const DEFAULT_CONNECT_PORT: u16 = 443;
const PUMP_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Pending,
    Authenticating,
    Connecting,
    Established,
    Closed,
    Failed,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed)
    }
}

/// `host:port` a CONNECT request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    /// Parses an authority-form request target. The port defaults to 443 and
    /// IPv6 literals must be bracketed.
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: &str| {
            ProxyError::Uri(format!("invalid CONNECT target '{}': {}", target, reason))
        };

        let (host, port) = if let Some(rest) = target.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| invalid("unclosed bracket"))?;
            let port = match after {
                "" => None,
                _ => Some(after.strip_prefix(':').ok_or_else(|| invalid("garbage after address"))?),
            };
            (host, port)
        } else {
            match target.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (target, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let bracketed = target.starts_with('[');
        if host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#') || (c == ':' && !bracketed))
        {
            return Err(invalid("host contains forbidden characters"));
        }

        let port = match port {
            None => DEFAULT_CONNECT_PORT,
            Some(port) => match port.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(invalid("bad port")),
            },
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelReport {
    pub target: Option<TunnelTarget>,
    pub state: TunnelState,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

pub struct TunnelSession<C> {
    client: C,
    request: RequestHead,
    head: Bytes,
    target: Option<TunnelTarget>,
    state: TunnelState,
}

impl<C> TunnelSession<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `head` holds any bytes the client sent after the CONNECT head that
    /// were already read off the socket.
    pub fn new(client: C, request: RequestHead, head: Bytes) -> Self {
        Self {
            client,
            request,
            head,
            target: None,
            state: TunnelState::Pending,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    fn transition(&mut self, next: TunnelState) {
        let target = self
            .target
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| self.request.target.clone());
        debug!("Tunnel {}: {:?} -> {:?}", target, self.state, next);
        self.state = next;
    }

    fn report(&self, client_to_upstream: u64, upstream_to_client: u64) -> TunnelReport {
        TunnelReport {
            target: self.target.clone(),
            state: self.state,
            client_to_upstream,
            upstream_to_client,
        }
    }

    async fn fail(mut self, response: &[u8]) -> TunnelReport {
        response::reject(&mut self.client, response).await;
        self.transition(TunnelState::Failed);
        self.report(0, 0)
    }

    /// Drives the session to a terminal state.
    pub async fn run(mut self, gate: &CredentialGate, config: &ProxyConfig) -> TunnelReport {
        let target = match TunnelTarget::parse(&self.request.target) {
            Ok(target) => target,
            Err(e) => {
                warn!("Rejecting CONNECT: {}", e);
                return self.fail(raw::BAD_REQUEST).await;
            }
        };
        self.target = Some(target.clone());

        self.transition(TunnelState::Authenticating);
        let auth_header = self.request.headers.get(PROXY_AUTHORIZATION);
        match gate.evaluate(auth_header) {
            AuthResult::Allowed => {}
            AuthResult::MissingCredentials => {
                warn!("Access denied for CONNECT {}: missing Proxy-Authorization header", target);
                return self.fail(raw::PROXY_AUTH_REQUIRED).await;
            }
            AuthResult::InvalidCredentials => {
                let user = CredentialGate::claimed_user(auth_header);
                warn!(
                    "Access denied for CONNECT {}: invalid user ({}) or password",
                    target,
                    user.as_deref().unwrap_or("unreadable")
                );
                return self.fail(raw::FORBIDDEN).await;
            }
        }

        self.transition(TunnelState::Connecting);
        let mut upstream = match connect(&target, config.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("HTTPS tunneling error: {}", e);
                return self.fail(raw::INTERNAL_SERVER_ERROR).await;
            }
        };

        // Pipelined bytes go upstream before anything relayed later.
        if !self.head.is_empty() {
            if let Err(e) = upstream.write_all(&self.head).await {
                error!("HTTPS tunneling error: failed to replay {} buffered bytes to {}: {}", self.head.len(), target, e);
                return self.fail(raw::INTERNAL_SERVER_ERROR).await;
            }
            debug!("Replayed {} buffered bytes to {}", self.head.len(), target);
        }

        if let Err(e) = self.client.write_all(raw::CONNECTION_ESTABLISHED).await {
            debug!("Client left before tunnel to {} was confirmed: {}", target, e);
            self.transition(TunnelState::Closed);
            return self.report(self.head.len() as u64, 0);
        }
        self.transition(TunnelState::Established);
        info!("HTTPS tunnel established on {}", target);

        let started = Instant::now();
        let (up, down, outcome) = relay(&mut self.client, upstream, config.half_close_grace).await;
        let up = up + self.head.len() as u64;

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_client_disconnect() => debug!("Tunnel {}: client disconnected: {}", target, e),
            Err(e) => error!("Tunnel {} failed: {}", target, e),
        }

        self.transition(TunnelState::Closed);
        info!(
            "HTTPS tunnel closed on {} ({} bytes up, {} bytes down, {:.1?})",
            target,
            up,
            down,
            started.elapsed()
        );
        self.report(up, down)
    }
}

async fn connect(target: &TunnelTarget, limit: Duration) -> Result<TcpStream, ProxyError> {
    let stream = timeout(limit, TcpStream::connect((target.host.as_str(), target.port)))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout(target.to_string()))?
        .map_err(|source| ProxyError::UpstreamConnect {
            target: target.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Copies `reader` into `writer` until EOF, then shuts `writer` down so the
/// close reaches the other side. `total` counts the bytes written so far and
/// stays valid if the future is dropped midway.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: Peer,
    to: Peer,
    total: &mut u64,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::new(from, IoOp::Read, e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| TransportError::new(to, IoOp::Write, e))?;
        *total += n as u64;
    }
    writer
        .shutdown()
        .await
        .map_err(|e| TransportError::new(to, IoOp::Write, e))
}

/// Relays bytes both ways. When one direction finishes cleanly the other is
/// given `grace` to drain; an error on either direction ends both at once.
/// Returns the byte counts (client to upstream, upstream to client).
async fn relay<C>(
    client: &mut C,
    upstream: TcpStream,
    grace: Duration,
) -> (u64, u64, Result<(), TransportError>)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let mut up = 0u64;
    let mut down = 0u64;

    let outcome = {
        let outbound = pin!(pump(&mut client_read, &mut upstream_write, Peer::Client, Peer::Upstream, &mut up));
        let inbound = pin!(pump(&mut upstream_read, &mut client_write, Peer::Upstream, Peer::Client, &mut down));

        match future::select(outbound, inbound).await {
            Either::Left((Ok(()), inbound)) => match timeout(grace, inbound).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Upstream kept its side open past the close grace period");
                    Ok(())
                }
            },
            Either::Right((Ok(()), outbound)) => match timeout(grace, outbound).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Client kept its side open past the close grace period");
                    Ok(())
                }
            },
            Either::Left((Err(e), _)) | Either::Right((Err(e), _)) => Err(e),
        }
    };

    (up, down, outcome)
}
