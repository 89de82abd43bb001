//! Listener and per-connection dispatch.
//!
//! Every accepted connection has its first request head read off the socket.
//! A CONNECT head hands the socket to a [`TunnelSession`]; anything else is
//! served by hyper's HTTP/1 server, which sees the already-read bytes first.

use crate::auth::{AuthResult, CredentialGate};
use crate::config::ProxyConfig;
use crate::error::{HeadError, ProxyError};
use crate::forwarder::Forwarder;
use crate::prebuffered::Prebuffered;
use crate::request::{self, RequestHead};
use crate::response::{self, ProxyBody, ResponseBuilder, raw};
use crate::tunnel::TunnelSession;
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct Shared {
    config: ProxyConfig,
    gate: CredentialGate,
    forwarder: Forwarder,
}

pub struct ProxyServer {
    shared: Arc<Shared>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let gate = CredentialGate::from_config(&config);
        let forwarder = Forwarder::new(&config)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                gate,
                forwarder,
            }),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let addr = self.shared.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })
    }

    /// Binds the configured address and serves until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let addr = listener.local_addr()?;
        let config = &self.shared.config;
        info!(
            "Proxy started on http://{} - redirects to {} ({})",
            addr,
            config.target_url,
            if config.requires_auth() {
                "requires authentication"
            } else {
                "no authentication"
            }
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Listener on {} stopped", addr);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.handle_connection(stream, peer).await;
            });
        }
    }
}

impl Shared {
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut reader = Prebuffered::new(stream, self.config.max_header_size);

        let limit = self.config.header_read_timeout;
        let peeked = match timeout(limit, RequestHead::peek(&mut reader)).await {
            Ok(peeked) => peeked,
            Err(_) => {
                debug!("{} sent no complete request within {:?}", peer, limit);
                response::reject(&mut reader, raw::REQUEST_TIMEOUT).await;
                return;
            }
        };

        let (head_len, head) = match peeked {
            Ok(parsed) => parsed,
            Err(HeadError::Closed) => {
                debug!("{} closed the connection before sending a request", peer);
                return;
            }
            Err(HeadError::Io(e)) => {
                debug!("Failed to read request from {}: {}", peer, e);
                return;
            }
            Err(e @ HeadError::TooLarge(_)) => {
                warn!("Rejecting request from {}: {}", peer, e);
                response::reject(&mut reader, raw::HEADER_TOO_LARGE).await;
                return;
            }
            Err(e @ HeadError::Malformed(_)) => {
                warn!("Rejecting request from {}: {}", peer, e);
                response::reject(&mut reader, raw::BAD_REQUEST).await;
                return;
            }
        };

        if head.is_connect() {
            info!("Request from {}: {} {}", peer, head.method, head.target);
            debug!("Headers:\n{}", head.describe_headers());

            reader.discard(head_len);
            let (buffered, stream) = reader.into_parts();
            let report = TunnelSession::new(stream, head, buffered)
                .run(&self.gate, &self.config)
                .await;
            debug!("Tunnel from {} finished: {:?}", peer, report);
        } else {
            self.serve_http(reader, peer).await;
        }
    }

    async fn serve_http(self: Arc<Self>, reader: Prebuffered<TcpStream>, peer: SocketAddr) {
        let header_read_timeout = self.config.header_read_timeout;
        let service = service_fn(move |req: Request<Incoming>| {
            let shared = self.clone();
            async move { Ok::<_, Infallible>(shared.handle_request(req, peer).await) }
        });

        if let Err(e) = ServerBuilder::new()
            .keep_alive(true)
            .timer(TokioTimer::new())
            .header_read_timeout(header_read_timeout)
            .serve_connection(TokioIo::new(reader), service)
            .await
        {
            debug!("Error serving HTTP connection from {}: {}", peer, e);
        }
    }

    async fn handle_request(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        info!("Request from {}: {} {}", peer, req.method(), req.uri());
        debug!("Headers:\n{}", request::describe_headers(req.headers()));

        if req.method() == Method::CONNECT {
            warn!("Rejecting CONNECT {} from {}: not the first request on its connection", req.uri(), peer);
            return ResponseBuilder::method_not_allowed(
                "CONNECT must be the first request on a connection",
            );
        }

        let auth_header = req.headers().get(AUTHORIZATION);
        match self.gate.evaluate(auth_header) {
            AuthResult::Allowed => {}
            AuthResult::MissingCredentials => {
                warn!("Access denied for {} {}: missing Authorization header", req.method(), req.uri());
                return ResponseBuilder::forbidden();
            }
            AuthResult::InvalidCredentials => {
                let user = CredentialGate::claimed_user(auth_header);
                warn!(
                    "Access denied for {} {}: invalid user ({}) or password",
                    req.method(),
                    req.uri(),
                    user.as_deref().unwrap_or("unreadable")
                );
                return ResponseBuilder::forbidden();
            }
        }

        self.forwarder.forward(req).await
    }
}
