use crate::error::ForwardError;
use std::sync::OnceLock;
use std::time::Duration;

/// Closed set of upstream failure kinds driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unknown,
    Network,
    Timeout,
    /// Generic non-retryable 4xx other than 401/429.
    Http,
    /// Upstream 5xx.
    ServerError,
    /// Failure after response bytes already reached the client.
    Stream,
    /// Upstream 401.
    Auth,
    /// Upstream 429.
    RateLimit,
    /// Response/stream payload could not be decoded.
    Parsing,
    ClientCancel,
    NoHealthyEndpoints,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Http => "http",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Stream => "stream",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Parsing => "parsing",
            ErrorKind::ClientCancel => "client_cancel",
            ErrorKind::NoHealthyEndpoints => "no_healthy_endpoints",
        }
    }
}

/// Classifier output handed to the retry policy and the lifecycle.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub request_id: String,
    pub endpoint_name: String,
    pub group_name: String,
    /// Attempts already spent against this endpoint when the error occurred.
    pub attempt_count: u32,
    pub kind: ErrorKind,
    /// Original error text, for logs and the lifecycle's failure reason.
    pub message: String,
    /// Upstream status, observed directly or recovered from the error text.
    pub http_status: Option<u16>,
    /// Upstream-provided `Retry-After` hint, when one was present.
    pub retryable_after: Option<Duration>,
    pub max_retries: u32,
}

impl ErrorContext {
    /// User-facing failure reason.
    pub fn reason(&self) -> String {
        match self.kind {
            ErrorKind::Auth => "upstream authentication failed".to_string(),
            ErrorKind::RateLimit => "upstream rate limited".to_string(),
            ErrorKind::ClientCancel => "cancelled by client".to_string(),
            ErrorKind::NoHealthyEndpoints => "no healthy endpoints available".to_string(),
            ErrorKind::Timeout => format!("upstream timeout: {}", self.message),
            ErrorKind::Network => format!("network error: {}", self.message),
            ErrorKind::ServerError => format!("upstream server error: {}", self.message),
            ErrorKind::Stream => format!("stream interrupted: {}", self.message),
            ErrorKind::Parsing => format!("response parse failure: {}", self.message),
            ErrorKind::Http | ErrorKind::Unknown => self.message.clone(),
        }
    }
}

/// Map a forward error to its kind.
///
/// Rules apply in order: cancellation, deadline, transport text, observed
/// HTTP status, stream/parse phase, the no-healthy-endpoints sentinel, then
/// `Unknown`.
pub fn classify(err: &ForwardError) -> ErrorKind {
    match err {
        ForwardError::Cancelled => ErrorKind::ClientCancel,
        ForwardError::RequestTimeout | ForwardError::HeaderTimeout => ErrorKind::Timeout,
        ForwardError::Transport(e) => classify_transport(e),
        ForwardError::Http { status, .. } => classify_status(*status),
        ForwardError::Stream(_) => ErrorKind::Stream,
        ForwardError::Body(_) => ErrorKind::Parsing,
        ForwardError::NoHealthyEndpoints => ErrorKind::NoHealthyEndpoints,
    }
}

fn classify_transport(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        return ErrorKind::Timeout;
    }
    if e.is_connect() {
        return ErrorKind::Network;
    }
    let text = e.to_string();
    if text.contains("timeout") || text.contains("timed out") {
        return ErrorKind::Timeout;
    }
    if text.contains("no such host")
        || text.contains("connection refused")
        || text.contains("connection reset")
        || text.contains("network unreachable")
        || text.contains("dns error")
    {
        return ErrorKind::Network;
    }
    ErrorKind::Unknown
}

fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::Auth,
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::ServerError,
        400..=499 => ErrorKind::Http,
        _ => ErrorKind::Unknown,
    }
}

/// Build the full error context for one failed attempt.
pub fn build_context(
    request_id: &str,
    endpoint_name: &str,
    group_name: &str,
    attempt_count: u32,
    max_retries: u32,
    err: &ForwardError,
    retryable_after: Option<Duration>,
) -> ErrorContext {
    let message = err.to_string();
    let http_status = err.status().or_else(|| {
        let parsed = extract_status_code(&message);
        (parsed != 0).then_some(parsed)
    });

    ErrorContext {
        request_id: request_id.to_string(),
        endpoint_name: endpoint_name.to_string(),
        group_name: group_name.to_string(),
        attempt_count,
        kind: classify(err),
        message,
        http_status,
        retryable_after,
        max_retries,
    }
}

/// Status codes we are willing to recover from free-form error text.
const KNOWN_STATUS_CODES: [u16; 21] = [
    400, 401, 403, 404, 405, 406, 408, 409, 410, 413, 414, 415, 416, 417, 429, 500, 501, 502, 503,
    504, 505,
];

fn phrase_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)(?:HTTP status|status code)\s+(\d{3})\b").expect("valid regex")
    })
}

fn bare_number_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\b(\d{3})\b").expect("valid regex"))
}

/// Recover an HTTP status code from free-form error text.
///
/// Tries the explicit `HTTP status N` / `status code N` phrases first, then
/// the first standalone three-digit number that is a known status code.
/// Returns 0 when nothing matches.
pub fn extract_status_code(message: &str) -> u16 {
    if let Some(caps) = phrase_pattern().captures(message) {
        if let Ok(n) = caps[1].parse::<u16>() {
            if KNOWN_STATUS_CODES.contains(&n) {
                return n;
            }
        }
    }

    for caps in bare_number_pattern().captures_iter(message) {
        if let Ok(n) = caps[1].parse::<u16>() {
            if KNOWN_STATUS_CODES.contains(&n) {
                return n;
            }
        }
    }

    0
}

/// 2xx and 3xx count as success: redirects are mirrored to the client as-is.
pub fn is_success(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Whether a failed status is worth trying on another endpoint.
///
/// 401 means bad credentials, 404/410 mean the resource does not exist
/// anywhere — neither improves by switching. 400/403/413 are frequently
/// endpoint-local (payload limits, regional blocks), as are 408/429/5xx.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 400 | 403 | 408 | 413 | 429) || status >= 500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(classify_status(401), ErrorKind::Auth);
        assert_eq!(classify_status(429), ErrorKind::RateLimit);
        assert_eq!(classify_status(500), ErrorKind::ServerError);
        assert_eq!(classify_status(503), ErrorKind::ServerError);
        assert_eq!(classify_status(404), ErrorKind::Http);
        assert_eq!(classify_status(413), ErrorKind::Http);
    }

    #[test]
    fn test_classify_forward_errors() {
        assert_eq!(classify(&ForwardError::Cancelled), ErrorKind::ClientCancel);
        assert_eq!(classify(&ForwardError::RequestTimeout), ErrorKind::Timeout);
        assert_eq!(classify(&ForwardError::HeaderTimeout), ErrorKind::Timeout);
        assert_eq!(
            classify(&ForwardError::NoHealthyEndpoints),
            ErrorKind::NoHealthyEndpoints
        );
        assert_eq!(
            classify(&ForwardError::Stream("reset".into())),
            ErrorKind::Stream
        );
        assert_eq!(
            classify(&ForwardError::Body("bad gzip".into())),
            ErrorKind::Parsing
        );
        assert_eq!(
            classify(&ForwardError::Http {
                status: 502,
                body: String::new()
            }),
            ErrorKind::ServerError
        );
    }

    #[test]
    fn test_extract_status_phrase() {
        assert_eq!(extract_status_code("HTTP status 502 bad gateway"), 502);
        assert_eq!(extract_status_code("upstream said status code 429"), 429);
        assert_eq!(extract_status_code("http status 404: not found"), 404);
    }

    #[test]
    fn test_extract_status_ignores_unknown_numbers() {
        assert_eq!(extract_status_code("error code 2000"), 0);
        assert_eq!(extract_status_code("completed in 123 ms"), 0);
        assert_eq!(extract_status_code(""), 0);
    }

    #[test]
    fn test_extract_status_first_known_match_wins() {
        assert_eq!(extract_status_code("error 404 then 301"), 404);
        assert_eq!(extract_status_code("saw 301 then 404"), 404);
        assert_eq!(extract_status_code("got 500 after 503"), 500);
    }

    #[test]
    fn test_is_success_range() {
        assert!(!is_success(199));
        assert!(is_success(200));
        assert!(is_success(204));
        assert!(is_success(301));
        assert!(is_success(399));
        assert!(!is_success(400));
        assert!(!is_success(500));
    }

    #[test]
    fn test_is_retryable_status() {
        for status in [400, 403, 429, 500, 502, 503, 599] {
            assert!(is_retryable_status(status), "{status} should be retryable");
        }
        for status in [401, 404, 410] {
            assert!(!is_retryable_status(status), "{status} should not be retryable");
        }
    }

    #[test]
    fn test_build_context_recovers_status_from_text() {
        let err = ForwardError::Stream("upstream closed with HTTP status 502".into());
        let ctx = build_context("req_1", "primary", "main", 2, 3, &err, None);
        assert_eq!(ctx.kind, ErrorKind::Stream);
        assert_eq!(ctx.http_status, Some(502));
        assert_eq!(ctx.attempt_count, 2);
    }

    #[test]
    fn test_context_reason_is_user_facing() {
        let err = ForwardError::Http {
            status: 401,
            body: String::new(),
        };
        let ctx = build_context("req_1", "primary", "main", 1, 3, &err, None);
        assert_eq!(ctx.reason(), "upstream authentication failed");
    }
}
