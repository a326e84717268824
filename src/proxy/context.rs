use bytes::Bytes;
use http::header::{HeaderMap, CONTENT_TYPE};
use http::StatusCode;
use http_body_util::{BodyExt, Full};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// The pre-parsed inbound request handed to the forwarding engine. The body
/// is buffered once before the retry loop so every attempt replays the same
/// bytes.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: http::Method,
    /// Path plus raw query, e.g. `/v1/messages?beta=true`.
    pub path_and_query: String,
    pub headers: HeaderMap,
}

/// Plain error reply for unary callers.
pub fn error_response(status: StatusCode, body: impl Into<Bytes>) -> hyper::Response<BoxBody> {
    let body = body.into();
    let content_type = if body.first() == Some(&b'{') {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    hyper::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(full_body(body))
        .expect("static error response must build")
}

/// SSE-shaped reply carrying a single sentinel line — used for streaming
/// requests that fail before any upstream byte reached the client.
pub fn sse_sentinel_response(status: StatusCode, sentinel: &str) -> hyper::Response<BoxBody> {
    sse_response_builder(status)
        .body(full_body(format!("{}\n\n", sentinel)))
        .expect("static sse response must build")
}

/// Response builder carrying the standard SSE header set.
///
/// `Transfer-Encoding` is deliberately absent: the connection is served by
/// hyper's auto h1/h2 builder, which chunk-frames unsized HTTP/1.1 bodies
/// itself and forbids the header entirely on HTTP/2.
pub fn sse_response_builder(status: StatusCode) -> http::response::Builder {
    hyper::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("access-control-allow-origin", "*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_content_type() {
        let resp = error_response(StatusCode::BAD_GATEWAY, r#"{"error":"x"}"#);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");

        let resp = error_response(StatusCode::BAD_GATEWAY, "All endpoints failed");
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
    }

    #[test]
    fn test_sse_sentinel_shape() {
        let resp = sse_sentinel_response(StatusCode::SERVICE_UNAVAILABLE, "data: error: down");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/event-stream");
    }
}
