use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Response, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Body type of every response produced by the plain forwarding path.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Raw responses written straight to the client socket on the CONNECT path.
pub mod raw {
    pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    pub const PROXY_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n";
    pub const FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
    pub const INTERNAL_SERVER_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
    pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
    pub const HEADER_TOO_LARGE: &[u8] = b"HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n";
    pub const REQUEST_TIMEOUT: &[u8] = b"HTTP/1.1 408 Request Timeout\r\n\r\n";
}

/// Writes a raw response, then shuts the socket down. Errors are ignored:
/// the client may already be gone.
pub async fn reject<W: AsyncWrite + Unpin>(socket: &mut W, response: &[u8]) {
    if socket.write_all(response).await.is_ok() {
        let _ = socket.flush().await;
    }
    let _ = socket.shutdown().await;
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Plain-path authentication denial.
    pub fn forbidden() -> Response<ProxyBody> {
        Self::error(StatusCode::FORBIDDEN, "Forbidden")
    }

    /// Upstream failure on the plain path.
    pub fn proxy_error(message: &str) -> Response<ProxyBody> {
        Self::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Proxy Error: {}", message),
        )
    }

    pub fn method_not_allowed(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::METHOD_NOT_ALLOWED, message)
    }

    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full(message.to_string()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
