use std::fmt;

/// Errors produced while forwarding a request to an upstream endpoint.
///
/// These are values, not unwound panics: handlers pass them to the classifier,
/// which maps them into the closed `ErrorKind` set driving the retry policy.
#[derive(Debug)]
pub enum ForwardError {
    /// Transport-level failure (DNS, connect, TLS, reset, ...).
    Transport(reqwest::Error),
    /// The per-endpoint request deadline elapsed (unary forwards).
    RequestTimeout,
    /// The response-header deadline elapsed (streaming forwards).
    HeaderTimeout,
    /// Upstream answered with a non-success status. The body snippet is kept
    /// for token extraction from 429/413/5xx error payloads.
    Http { status: u16, body: String },
    /// The inbound caller went away.
    Cancelled,
    /// Candidate lookup produced nothing to try.
    NoHealthyEndpoints,
    /// Failure after response bytes were already forwarded to the client.
    Stream(String),
    /// Response body could not be read or decoded.
    Body(String),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::Transport(e) => write!(f, "transport error: {}", e),
            ForwardError::RequestTimeout => write!(f, "request timeout"),
            ForwardError::HeaderTimeout => write!(f, "response header timeout"),
            ForwardError::Http { status, .. } => write!(f, "HTTP status {}", status),
            ForwardError::Cancelled => write!(f, "request cancelled by client"),
            ForwardError::NoHealthyEndpoints => write!(f, "no healthy endpoints available"),
            ForwardError::Stream(msg) => write!(f, "stream error: {}", msg),
            ForwardError::Body(msg) => write!(f, "body error: {}", msg),
        }
    }
}

impl std::error::Error for ForwardError {}

impl ForwardError {
    /// Upstream HTTP status, when one was observed.
    pub fn status(&self) -> Option<u16> {
        match self {
            ForwardError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
