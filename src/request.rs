use crate::error::HeadError;
use crate::prebuffered::Prebuffered;
use http::header::{AUTHORIZATION, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::io::AsyncRead;

const MAX_HEADERS: usize = 96;

/// Request line and header section of the first request on a connection.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as sent (`host:port` for CONNECT).
    pub target: String,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Parses a head from `buf`. Returns `None` while the head is incomplete,
    /// otherwise the head and the number of bytes it occupies.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(httparse::Status::Partial) => return Ok(None),
            Ok(httparse::Status::Complete(len)) => len,
            Err(e) => return Err(HeadError::Malformed(e.to_string())),
        };

        let method = req
            .method
            .ok_or_else(|| HeadError::Malformed("missing method".to_string()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| HeadError::Malformed(e.to_string()))?;
        let target = req
            .path
            .ok_or_else(|| HeadError::Malformed("missing request target".to_string()))?
            .to_string();

        let mut map = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| HeadError::Malformed(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| HeadError::Malformed(e.to_string()))?;
            map.append(name, value);
        }

        Ok(Some((len, Self { method, target, headers: map })))
    }

    /// Buffers from `reader` until a full head is available. The head bytes
    /// stay in the buffer; the caller decides whether to discard them.
    pub async fn peek<S: AsyncRead + Unpin>(
        reader: &mut Prebuffered<S>,
    ) -> Result<(usize, Self), HeadError> {
        loop {
            if let Some(parsed) = Self::parse(reader.buffer())? {
                return Ok(parsed);
            }
            if reader.is_full() {
                return Err(HeadError::TooLarge(reader.buffer().len()));
            }
            if reader.buffer_more().await? == 0 {
                return Err(HeadError::Closed);
            }
        }
    }

    pub fn describe_headers(&self) -> String {
        describe_headers(&self.headers)
    }
}

/// Headers rendered one per line for debug logs, credentials masked.
pub fn describe_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if *name == AUTHORIZATION || *name == PROXY_AUTHORIZATION {
                "<redacted>"
            } else {
                value.to_str().unwrap_or("<binary>")
            };
            format!("   {} => {}", name, shown)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
