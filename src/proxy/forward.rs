use crate::config::StreamingConfig;
use crate::endpoint::Endpoint;
use crate::error::ForwardError;
use crate::proxy::context::InboundRequest;
use crate::transport::Transports;
use bytes::Bytes;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION,
    CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Builds and executes one outbound attempt against a chosen endpoint.
///
/// Returns the upstream response for *any* status — the handler owns
/// success/error interpretation. Errors here are transport-level only:
/// connect failures, deadlines, and caller cancellation.
pub struct Forwarder {
    transports: Transports,
    header_timeout: Duration,
}

impl Forwarder {
    pub fn new(transports: Transports, streaming: &StreamingConfig) -> Self {
        Self {
            transports,
            header_timeout: streaming.header_timeout(),
        }
    }

    /// Unary forward, bounded by the endpoint's per-request timeout.
    pub async fn forward_unary(
        &self,
        cancel: &CancellationToken,
        inbound: &InboundRequest,
        body: &Bytes,
        endpoint: &Endpoint,
    ) -> Result<reqwest::Response, ForwardError> {
        let request = self.build_request(self.transports.unary(), inbound, body, endpoint, false);
        execute(cancel, request, endpoint.timeout, ForwardError::RequestTimeout).await
    }

    /// Streaming forward: the deadline covers response headers only — the
    /// stream body itself is unbounded.
    pub async fn forward_streaming(
        &self,
        cancel: &CancellationToken,
        inbound: &InboundRequest,
        body: &Bytes,
        endpoint: &Endpoint,
    ) -> Result<reqwest::Response, ForwardError> {
        let request =
            self.build_request(self.transports.streaming(), inbound, body, endpoint, true);
        execute(cancel, request, self.header_timeout, ForwardError::HeaderTimeout).await
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        inbound: &InboundRequest,
        body: &Bytes,
        endpoint: &Endpoint,
        streaming: bool,
    ) -> reqwest::RequestBuilder {
        let url = compose_url(&endpoint.url, &inbound.path_and_query);
        let headers = assemble_headers(&inbound.headers, endpoint, streaming);

        client
            .request(inbound.method.clone(), url)
            .headers(headers)
            .body(body.clone())
    }
}

async fn execute(
    cancel: &CancellationToken,
    request: reqwest::RequestBuilder,
    deadline: Duration,
    timeout_error: ForwardError,
) -> Result<reqwest::Response, ForwardError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ForwardError::Cancelled),
        result = tokio::time::timeout(deadline, request.send()) => match result {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(ForwardError::Transport(e)),
            Err(_) => Err(timeout_error),
        },
    }
}

/// Endpoint base URL concatenated with the inbound path and raw query.
pub fn compose_url(base: &str, path_and_query: &str) -> String {
    format!("{}{}", base, path_and_query)
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

/// Produce the outbound header set for one endpoint:
/// inbound copy minus auth/Host/hop-by-hop, auth injected from the endpoint
/// definition, custom endpoint headers applied last.
pub fn assemble_headers(inbound: &HeaderMap, endpoint: &Endpoint, streaming: bool) -> HeaderMap {
    let mut headers = inbound.clone();

    headers.remove(HOST);
    headers.remove(AUTHORIZATION);
    headers.remove(&X_API_KEY);
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    // The transport recomputes the length from the buffered body.
    headers.remove(CONTENT_LENGTH);
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }

    if let Some(host) = host_of(&endpoint.url) {
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(HOST, value);
        }
    }

    if !endpoint.token.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", endpoint.token)) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    if let Some(ref api_key) = endpoint.api_key {
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert(X_API_KEY.clone(), value);
        }
    }

    // Unary bodies are decompressed by the handler (gzip only); streams must
    // arrive unencoded to be parsed line-by-line.
    let accept = if streaming { "identity" } else { "gzip" };
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(accept));

    for (name, value) in &endpoint.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    headers
}

/// `host[:port]` component of a base URL, without the scheme.
fn host_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}:{}", host, port)),
        None => Some(host.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn endpoint() -> Endpoint {
        Endpoint {
            name: "primary".into(),
            url: "https://api.example.com".into(),
            priority: 0,
            group: "main".into(),
            group_priority: 0,
            timeout: Duration::from_secs(30),
            token: "sk-test-token".into(),
            api_key: Some("ak-test-key".into()),
            headers: HashMap::from([("x-custom".to_string(), "custom-value".to_string())]),
        }
    }

    fn inbound_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("relay.local"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller-token"));
        headers.insert("x-api-key", HeaderValue::from_static("caller-key"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailers", HeaderValue::from_static("x-t"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers
    }

    #[test]
    fn test_auth_headers_replaced_exactly() {
        let headers = assemble_headers(&inbound_headers(), &endpoint(), false);
        assert_eq!(headers[AUTHORIZATION], "Bearer sk-test-token");
        assert_eq!(headers["x-api-key"], "ak-test-key");
    }

    #[test]
    fn test_host_matches_endpoint_url() {
        let headers = assemble_headers(&inbound_headers(), &endpoint(), false);
        assert_eq!(headers[HOST], "api.example.com");

        let mut ep = endpoint();
        ep.url = "http://10.0.0.1:8080".into();
        let headers = assemble_headers(&inbound_headers(), &ep, false);
        assert_eq!(headers[HOST], "10.0.0.1:8080");
    }

    #[test]
    fn test_hop_by_hop_headers_stripped() {
        let headers = assemble_headers(&inbound_headers(), &endpoint(), false);
        for name in [
            "connection",
            "keep-alive",
            "proxy-authenticate",
            "proxy-authorization",
            "te",
            "trailers",
            "transfer-encoding",
            "upgrade",
        ] {
            assert!(!headers.contains_key(name), "{name} must be stripped");
        }
    }

    #[test]
    fn test_end_to_end_headers_preserved() {
        let headers = assemble_headers(&inbound_headers(), &endpoint(), false);
        assert_eq!(headers["anthropic-version"], "2023-06-01");
    }

    #[test]
    fn test_custom_headers_applied_last() {
        let mut ep = endpoint();
        ep.headers
            .insert("authorization".to_string(), "Bearer override".to_string());
        let headers = assemble_headers(&inbound_headers(), &ep, false);
        assert_eq!(headers[AUTHORIZATION], "Bearer override");
        assert_eq!(headers["x-custom"], "custom-value");
    }

    #[test]
    fn test_accept_encoding_per_mode() {
        let unary = assemble_headers(&inbound_headers(), &endpoint(), false);
        assert_eq!(unary[ACCEPT_ENCODING], "gzip");

        let streaming = assemble_headers(&inbound_headers(), &endpoint(), true);
        assert_eq!(streaming[ACCEPT_ENCODING], "identity");
    }

    #[test]
    fn test_missing_api_key_not_injected() {
        let mut ep = endpoint();
        ep.api_key = None;
        let headers = assemble_headers(&inbound_headers(), &ep, false);
        assert!(!headers.contains_key("x-api-key"));
    }

    #[test]
    fn test_compose_url() {
        assert_eq!(
            compose_url("https://api.example.com", "/v1/messages?beta=true"),
            "https://api.example.com/v1/messages?beta=true"
        );
    }
}
