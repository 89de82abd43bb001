use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::response::{ProxyBody, ResponseBuilder};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{info, warn};
use std::error::Error as _;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Relays ordinary HTTP requests to the fixed upstream target.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    target_url: Url,
    host_header: HeaderValue,
    timeout_duration: Duration,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connect_timeout));

        // One upstream connection per request; idle connections are never kept.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(HttpsConnector::new_with_connector(http));

        let host_header = HeaderValue::from_str(&target_authority(&config.target_url)?)
            .map_err(|e| ProxyError::Http(format!("Invalid Host header for target: {}", e)))?;

        Ok(Self {
            client,
            target_url: config.target_url.clone(),
            host_header,
            timeout_duration: config.upstream_timeout,
        })
    }

    /// Forwards `req` upstream. Failures become a 500 response; nothing is
    /// retried.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        match self.process_request(req).await {
            Ok(response) => {
                info!("{} {} -> {} ({})", method, path, self.target_url, response.status());
                response
            }
            Err(e) => {
                warn!("Forwarding {} {} to {} failed: {}", method, path, self.target_url, e);
                ResponseBuilder::proxy_error(&e.to_string())
            }
        }
    }

    async fn process_request(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let target_uri = self.build_target_uri(req.uri())?;
        self.modify_request(&mut req, target_uri);

        let response = timeout(self.timeout_duration, self.client.request(req))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(self.target_url.to_string()))?
            .map_err(|e| ProxyError::Connection(describe_client_error(&e)))?;

        Ok(modify_response(response).map(|body| body.boxed()))
    }

    /// Joins the target's base path with the inbound `path?query`. Any scheme
    /// or authority on the inbound URI is dropped.
    pub fn build_target_uri(&self, inbound: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = inbound.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let path_and_query = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };

        let mut base = self.target_url.clone();
        base.set_query(None);
        base.set_fragment(None);
        let target = format!("{}{}", base.as_str().trim_end_matches('/'), path_and_query);

        target
            .parse::<Uri>()
            .map_err(|e| ProxyError::Uri(e.to_string()))
    }

    fn modify_request(&self, req: &mut Request<Incoming>, target_uri: Uri) {
        *req.uri_mut() = target_uri;
        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        headers.insert(HOST, self.host_header.clone());
    }
}

fn modify_response<B>(mut response: Response<B>) -> Response<B> {
    strip_hop_by_hop(response.headers_mut());
    response
}

/// Removes the fixed hop-by-hop set plus every header named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// `host` or `host:port` when the port differs from the scheme default.
fn target_authority(url: &Url) -> Result<String, ProxyError> {
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::Uri(format!("{} has no host", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn describe_client_error(err: &hyper_util::client::legacy::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message = format!("{}: {}", message, cause);
        source = cause.source();
    }
    message
}
