//! Integration tests for CONNECT tunnels through a running proxy

use gatekeep::response::raw;
use gatekeep::{Credentials, ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

fn open_config() -> ProxyConfig {
    ProxyConfig::new(1, Url::parse("http://upstream.local").unwrap())
        .with_connect_timeout(Duration::from_secs(2))
        .with_half_close_grace(Duration::from_millis(500))
}

fn alice_config() -> ProxyConfig {
    open_config().with_credential(Credentials::new("alice", "secret").unwrap())
}

async fn start_proxy(config: ProxyConfig) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = ProxyServer::new(config).unwrap();
    tokio::spawn(server.serve(listener, shutdown.clone()));
    (addr, shutdown)
}

/// Echo server counting the connections it accepted.
async fn echo_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    (addr, accepted)
}

async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn send_connect(proxy: SocketAddr, target: SocketAddr, auth: Option<&str>, extra: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut head = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = auth {
        head.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    head.push_str("\r\n");
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(extra);
    stream.write_all(&bytes).await.unwrap();
    stream
}

async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    buf
}

async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut buf)).await.unwrap().unwrap();
    buf
}

/// Without a configured user every CONNECT is tunnelled
#[tokio::test]
async fn test_open_proxy_tunnels_and_echoes() {
    let (upstream, accepted) = echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(open_config()).await;

    let mut client = send_connect(proxy, upstream, None, b"").await;
    assert_eq!(read_exact_len(&mut client, raw::CONNECTION_ESTABLISHED.len()).await, raw::CONNECTION_ESTABLISHED);

    client.write_all(b"hello tunnel").await.unwrap();
    assert_eq!(read_exact_len(&mut client, 12).await, b"hello tunnel");
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

/// Open proxy ignores whatever credentials the client sends
#[tokio::test]
async fn test_open_proxy_ignores_credentials() {
    let (upstream, _) = echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(open_config()).await;

    let mut client = send_connect(proxy, upstream, Some("Basic bm9ib2R5Om5vdGhpbmc="), b"").await;
    assert_eq!(read_exact_len(&mut client, raw::CONNECTION_ESTABLISHED.len()).await, raw::CONNECTION_ESTABLISHED);
}

/// Correct credentials open the tunnel
#[tokio::test]
async fn test_valid_credentials_are_admitted() {
    let (upstream, _) = echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(alice_config()).await;

    let mut client = send_connect(proxy, upstream, Some("Basic YWxpY2U6c2VjcmV0"), b"").await;
    assert_eq!(read_exact_len(&mut client, raw::CONNECTION_ESTABLISHED.len()).await, raw::CONNECTION_ESTABLISHED);

    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_len(&mut client, 4).await, b"ping");
}

/// The auth scheme name is matched case-insensitively
#[tokio::test]
async fn test_scheme_is_case_insensitive() {
    let (upstream, _) = echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(alice_config()).await;

    let mut client = send_connect(proxy, upstream, Some("basic YWxpY2U6c2VjcmV0"), b"").await;
    assert_eq!(read_exact_len(&mut client, raw::CONNECTION_ESTABLISHED.len()).await, raw::CONNECTION_ESTABLISHED);
}

/// Wrong password is answered 403 and no upstream connection is made
#[tokio::test]
async fn test_invalid_credentials_are_forbidden() {
    let (upstream, accepted) = echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(alice_config()).await;

    let mut client = send_connect(proxy, upstream, Some("Basic YWxpY2U6d3Jvbmc="), b"").await;
    assert_eq!(read_all(&mut client).await, raw::FORBIDDEN);
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

/// A missing Proxy-Authorization header gets the Basic challenge
#[tokio::test]
async fn test_missing_credentials_get_challenge() {
    let (upstream, accepted) = echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(alice_config()).await;

    let mut client = send_connect(proxy, upstream, None, b"").await;
    let response = read_all(&mut client).await;
    assert_eq!(
        response,
        b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n"
    );
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

/// Unreachable upstream is answered 500 and the client socket is closed
#[tokio::test]
async fn test_unreachable_upstream_is_500() {
    let target = unreachable_addr().await;
    let (proxy, _shutdown) = start_proxy(open_config()).await;

    let mut client = send_connect(proxy, target, None, b"").await;
    assert_eq!(read_all(&mut client).await, raw::INTERNAL_SERVER_ERROR);
}

/// Bytes sent right behind the CONNECT head reach upstream first and in order
#[tokio::test]
async fn test_pipelined_bytes_are_replayed_first() {
    let (upstream, _) = echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(open_config()).await;

    let mut client = send_connect(proxy, upstream, None, b"early-bytes|").await;
    assert_eq!(read_exact_len(&mut client, raw::CONNECTION_ESTABLISHED.len()).await, raw::CONNECTION_ESTABLISHED);

    client.write_all(b"later").await.unwrap();
    assert_eq!(read_exact_len(&mut client, 17).await, b"early-bytes|later");
}

/// Client closing its side closes the upstream side and the tunnel ends
#[tokio::test]
async fn test_client_close_propagates_upstream() {
    let (upstream, _) = echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(open_config()).await;

    let mut client = send_connect(proxy, upstream, None, b"").await;
    assert_eq!(read_exact_len(&mut client, raw::CONNECTION_ESTABLISHED.len()).await, raw::CONNECTION_ESTABLISHED);

    client.write_all(b"last words").await.unwrap();
    client.shutdown().await.unwrap();
    // The echo server sees EOF, closes, and that close comes back to us.
    assert_eq!(read_all(&mut client).await, b"last words");
}

/// Upstream closing first closes the client side
#[tokio::test]
async fn test_upstream_close_propagates_to_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"bye").await.unwrap();
        socket.shutdown().await.unwrap();
        // Keep the read side open; the proxy must still close the client.
        let mut sink = Vec::new();
        let _ = socket.read_to_end(&mut sink).await;
    });

    let (proxy, _shutdown) = start_proxy(open_config()).await;
    let mut client = send_connect(proxy, upstream, None, b"").await;
    assert_eq!(read_exact_len(&mut client, raw::CONNECTION_ESTABLISHED.len()).await, raw::CONNECTION_ESTABLISHED);
    assert_eq!(read_all(&mut client).await, b"bye");
}

/// Authority without a usable port is a bad request
#[tokio::test]
async fn test_bad_connect_target_is_400() {
    let (proxy, _shutdown) = start_proxy(open_config()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT example.com:https HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_all(&mut client).await, raw::BAD_REQUEST);
}

/// Oversized request heads are refused before any dispatch
#[tokio::test]
async fn test_oversized_head_is_431() {
    let mut config = open_config();
    config.max_header_size = 1024;
    let (proxy, _shutdown) = start_proxy(config).await;

    let mut head = b"CONNECT example.com:443 HTTP/1.1\r\nX-Fill: ".to_vec();
    head.resize(1024, b'a');

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&head).await.unwrap();
    assert_eq!(read_all(&mut client).await, raw::HEADER_TOO_LARGE);
}

/// Garbage request lines are answered 400
#[tokio::test]
async fn test_malformed_head_is_400() {
    let (proxy, _shutdown) = start_proxy(open_config()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"GET / HTTP/9.9\r\n\r\n").await.unwrap();
    assert_eq!(read_all(&mut client).await, raw::BAD_REQUEST);
}

/// Cancelling the token stops the accept loop
#[tokio::test]
async fn test_shutdown_stops_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    let server = ProxyServer::new(open_config()).unwrap();
    let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

    shutdown.cancel();
    let result = timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

/// An upstream that never closes its side is cut off after the grace period
#[tokio::test]
async fn test_half_closed_tunnel_ends_after_grace() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let (saw_eof_tx, saw_eof_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"0123456789").await.unwrap();
        let mut sink = Vec::new();
        let _ = socket.read_to_end(&mut sink).await;
        let _ = saw_eof_tx.send(sink);
        // Hold the socket open without ever writing EOF.
        std::future::pending::<()>().await;
    });

    let (proxy, _shutdown) = start_proxy(open_config()).await;
    let mut client = send_connect(proxy, upstream, None, b"").await;
    assert_eq!(read_exact_len(&mut client, raw::CONNECTION_ESTABLISHED.len()).await, raw::CONNECTION_ESTABLISHED);
    assert_eq!(read_exact_len(&mut client, 10).await, b"0123456789");

    client.write_all(b"abc").await.unwrap();
    client.shutdown().await.unwrap();

    // Our half-close reaches upstream, then the grace period (500 ms) runs
    // out and the proxy drops the client side as well.
    assert_eq!(timeout(WAIT, saw_eof_rx).await.unwrap().unwrap(), b"abc");
    let mut rest = Vec::new();
    let started = std::time::Instant::now();
    let _ = timeout(Duration::from_secs(3), client.read_to_end(&mut rest))
        .await
        .expect("client side was not closed after the grace period");
    assert!(rest.is_empty());
    assert!(started.elapsed() < Duration::from_secs(3));
}

/// A CONNECT target that never answers the handshake fails with 500 in time
#[tokio::test]
async fn test_connect_timeout_is_500() {
    let config = open_config().with_connect_timeout(Duration::from_millis(300));
    let (proxy, _shutdown) = start_proxy(config).await;

    // Non-routable address: the handshake either hangs until the timeout or
    // fails at once; both must end in a 500.
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT 10.255.255.1:443 HTTP/1.1\r\nHost: 10.255.255.1:443\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(3), client.read_to_end(&mut response))
        .await
        .expect("no response before the connect timeout")
        .unwrap();
    assert_eq!(response, raw::INTERNAL_SERVER_ERROR);
}

/// A client that connects but never sends a request head is closed
#[tokio::test]
async fn test_idle_client_gets_408() {
    let config = open_config().with_header_read_timeout(Duration::from_millis(300));
    let (proxy, _shutdown) = start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(read_all(&mut client).await, raw::REQUEST_TIMEOUT);
}

/// A partial head that stalls is closed the same way
#[tokio::test]
async fn test_stalled_head_gets_408() {
    let config = open_config().with_header_read_timeout(Duration::from_millis(300));
    let (proxy, _shutdown) = start_proxy(config).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n").await.unwrap();
    assert_eq!(read_all(&mut client).await, raw::REQUEST_TIMEOUT);
}
