use crate::proxy::classify::ErrorContext;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Request lifecycle states. The four terminal states accept no further
/// mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Forwarding,
    Processing,
    Retry,
    Suspended,
    Completed,
    Error,
    Cancelled,
    Timeout,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Forwarding => "forwarding",
            RequestStatus::Processing => "processing",
            RequestStatus::Retry => "retry",
            RequestStatus::Suspended => "suspended",
            RequestStatus::Completed => "completed",
            RequestStatus::Error => "error",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Error
                | RequestStatus::Cancelled
                | RequestStatus::Timeout
        )
    }
}

/// Token totals extracted from an upstream response or stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub model: Option<String>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_creation_tokens == 0
            && self.cache_read_tokens == 0
    }
}

#[derive(Debug)]
struct LifecycleInner {
    endpoint: String,
    group: String,
    model: String,
    model_source: Option<&'static str>,
    status: RequestStatus,
    attempt_index: u32,
    http_status: u16,
    tokens: Option<TokenUsage>,
    failure_reason: String,
    pending_error: Option<ErrorContext>,
    finished_at: Option<Instant>,
}

/// Read-only view for metrics and the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub request_id: String,
    pub endpoint: String,
    pub group: String,
    pub model: String,
    pub status: &'static str,
    pub attempts: u32,
    pub http_status: u16,
    pub tokens: Option<TokenUsage>,
    pub failure_reason: String,
    pub elapsed_ms: u64,
}

/// The single authoritative record of one inbound request.
///
/// Handlers are the only writers and hold at most one logical owner at a
/// time; the mutex serializes their mutations against snapshot readers. The
/// attempt counter is atomic so the retry policy can read it without taking
/// the lock. Once a terminal state is reached every further mutation is
/// rejected and logged.
pub struct RequestLifecycle {
    id: String,
    started_at: Instant,
    attempts: AtomicU32,
    inner: Mutex<LifecycleInner>,
}

impl RequestLifecycle {
    pub fn new(id: String) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            attempts: AtomicU32::new(0),
            inner: Mutex::new(LifecycleInner {
                endpoint: String::new(),
                group: String::new(),
                model: String::new(),
                model_source: None,
                status: RequestStatus::Forwarding,
                attempt_index: 0,
                http_status: 0,
                tokens: None,
                failure_reason: String::new(),
                pending_error: None,
                finished_at: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ---- Non-terminal mutation ----

    pub fn set_endpoint(&self, endpoint: &str, group: &str) {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            return;
        }
        inner.endpoint = endpoint.to_string();
        inner.group = group.to_string();
    }

    pub fn set_model(&self, model: &str) {
        let mut inner = self.lock();
        if inner.status.is_terminal() || model.is_empty() {
            return;
        }
        inner.model = model.to_string();
    }

    /// Record the model from `source` ("request", "stream", "response"),
    /// warning when two sources disagree. The first writer wins; later
    /// sources only fill an empty slot.
    pub fn set_model_with_comparison(&self, model: &str, source: &'static str) {
        if model.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            return;
        }
        if inner.model.is_empty() {
            inner.model = model.to_string();
            inner.model_source = Some(source);
            return;
        }
        if inner.model != model {
            warn!(
                "lifecycle: model mismatch, request_id={}, kept={} (from {}), observed={} (from {})",
                self.id,
                inner.model,
                inner.model_source.unwrap_or("unknown"),
                model,
                source
            );
        }
    }

    pub fn has_model(&self) -> bool {
        !self.lock().model.is_empty()
    }

    /// Record a non-terminal status change. Rejected (returning `false`)
    /// once the lifecycle is terminal; the attempt index never decreases.
    pub fn update_status(&self, status: RequestStatus, attempt_index: u32, http_status: u16) -> bool {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            warn!(
                "lifecycle: status update after terminal state rejected, request_id={}, from={}, to={}",
                self.id,
                inner.status.as_str(),
                status.as_str()
            );
            return false;
        }
        inner.status = status;
        inner.attempt_index = inner.attempt_index.max(attempt_index);
        if http_status != 0 {
            inner.http_status = http_status;
        }
        if status.is_terminal() {
            inner.finished_at = Some(Instant::now());
        }
        true
    }

    // ---- Attempt accounting ----

    pub fn increment_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    // ---- Error capture ----

    /// Cache the classifier's output so `handle_error` does not re-classify.
    pub fn prepare_error_context(&self, ctx: ErrorContext) {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            return;
        }
        inner.pending_error = Some(ctx);
    }

    /// Record an error and its derived failure reason. Does not itself
    /// change the status — the handler decides whether this attempt ends
    /// the request.
    pub fn handle_error(&self, message: &str) {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            return;
        }
        match inner.pending_error.take() {
            Some(ctx) => {
                inner.failure_reason = ctx.reason();
                if let Some(status) = ctx.http_status {
                    inner.http_status = status;
                }
            }
            None => inner.failure_reason = message.to_string(),
        }
        debug!(
            "lifecycle: error recorded, request_id={}, reason={}",
            self.id, inner.failure_reason
        );
    }

    // ---- Terminal transitions ----

    /// Successful completion; attaches tokens when the response carried them.
    pub fn complete_request(&self, tokens: Option<TokenUsage>) -> bool {
        let mut inner = self.lock();
        if !Self::enter_terminal(&self.id, &mut inner, RequestStatus::Completed) {
            return false;
        }
        if inner.http_status == 0 {
            inner.http_status = 200;
        }
        Self::attach_tokens(&self.id, &mut inner, tokens);
        true
    }

    /// Successful completion of a response that carried no usage record
    /// (non-JSON or non-token payload). Logged for diagnosis only.
    pub fn handle_non_token_response(&self, body_preview: &str) -> bool {
        debug!(
            "lifecycle: completed without usage record, request_id={}, body_preview={:.80}",
            self.id, body_preview
        );
        self.complete_request(None)
    }

    /// Attach tokens observed on a request that still fails — e.g. usage
    /// embedded in a 429 error body, or a stream that died after the usage
    /// record arrived.
    pub fn record_tokens_for_failed_request(&self, tokens: TokenUsage, reason: &str) {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            warn!(
                "lifecycle: token attach after terminal state rejected, request_id={}",
                self.id
            );
            return;
        }
        Self::attach_tokens(&self.id, &mut inner, Some(tokens));
        if inner.failure_reason.is_empty() {
            inner.failure_reason = reason.to_string();
        }
    }

    pub fn cancel_request(&self, reason: &str, tokens: Option<TokenUsage>) -> bool {
        let mut inner = self.lock();
        if !Self::enter_terminal(&self.id, &mut inner, RequestStatus::Cancelled) {
            return false;
        }
        inner.failure_reason = reason.to_string();
        if inner.http_status == 0 {
            inner.http_status = 499;
        }
        Self::attach_tokens(&self.id, &mut inner, tokens);
        true
    }

    pub fn fail_request(&self, reason: &str, message: &str, http_status: u16) -> bool {
        let mut inner = self.lock();
        if !Self::enter_terminal(&self.id, &mut inner, RequestStatus::Error) {
            return false;
        }
        inner.failure_reason = if reason.is_empty() {
            message.to_string()
        } else {
            format!("{}: {}", reason, message)
        };
        inner.http_status = http_status;
        true
    }

    /// Terminal timeout — used when a suspension wait expires.
    pub fn timeout_request(&self, message: &str) -> bool {
        let mut inner = self.lock();
        if !Self::enter_terminal(&self.id, &mut inner, RequestStatus::Timeout) {
            return false;
        }
        inner.failure_reason = message.to_string();
        if inner.http_status == 0 {
            inner.http_status = 502;
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().status.is_terminal()
    }

    // ---- Observation ----

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let inner = self.lock();
        let elapsed = match inner.finished_at {
            Some(at) => at.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        };
        LifecycleSnapshot {
            request_id: self.id.clone(),
            endpoint: inner.endpoint.clone(),
            group: inner.group.clone(),
            model: inner.model.clone(),
            status: inner.status.as_str(),
            attempts: self.attempt_count(),
            http_status: inner.http_status,
            tokens: inner.tokens.clone(),
            failure_reason: inner.failure_reason.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.lock().status
    }

    // ---- Internals ----

    fn enter_terminal(id: &str, inner: &mut LifecycleInner, status: RequestStatus) -> bool {
        if inner.status.is_terminal() {
            warn!(
                "lifecycle: duplicate terminal transition rejected, request_id={}, have={}, attempted={}",
                id,
                inner.status.as_str(),
                status.as_str()
            );
            return false;
        }
        inner.status = status;
        inner.finished_at = Some(Instant::now());
        true
    }

    fn attach_tokens(id: &str, inner: &mut LifecycleInner, tokens: Option<TokenUsage>) {
        let Some(tokens) = tokens else {
            return;
        };
        if inner.tokens.is_some() {
            warn!("lifecycle: tokens already attached, request_id={}", id);
            return;
        }
        if let Some(ref model) = tokens.model {
            if inner.model.is_empty() {
                inner.model = model.clone();
            }
        }
        inner.tokens = Some(tokens);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Creates lifecycles and tracks the in-flight set for the admin surface.
///
/// The server owns one registry and passes the created lifecycle *into* each
/// handler call; handlers never construct lifecycles themselves.
pub struct LifecycleRegistry {
    active: DashMap<String, Arc<RequestLifecycle>>,
    next_seq: AtomicU64,
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self {
            active: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a lifecycle with a fresh request id.
    pub fn create(&self) -> Arc<RequestLifecycle> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("req_{:08x}", seq);
        let lifecycle = Arc::new(RequestLifecycle::new(id.clone()));
        self.active.insert(id, lifecycle.clone());
        metrics::gauge!("relay_requests_in_flight").increment(1.0);
        lifecycle
    }

    /// Drop a finished lifecycle from the in-flight set.
    pub fn release(&self, id: &str) {
        if self.active.remove(id).is_some() {
            metrics::gauge!("relay_requests_in_flight").decrement(1.0);
        }
    }

    pub fn snapshot_active(&self) -> Vec<LifecycleSnapshot> {
        let mut snaps: Vec<LifecycleSnapshot> = self
            .active
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snaps.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        snaps
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForwardError;
    use crate::proxy::classify::build_context;

    fn usage(output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: 10,
            output_tokens: output,
            cache_creation_tokens: 0,
            cache_read_tokens: 5,
            model: Some("claude-3-5-sonnet".to_string()),
        }
    }

    #[test]
    fn test_exactly_one_terminal_transition() {
        let lc = RequestLifecycle::new("req_1".into());
        assert!(lc.complete_request(Some(usage(42))));
        assert!(!lc.fail_request("error", "late failure", 502));
        assert!(!lc.cancel_request("late cancel", None));
        assert!(!lc.complete_request(None));

        let snap = lc.snapshot();
        assert_eq!(snap.status, "completed");
        assert_eq!(snap.tokens.unwrap().output_tokens, 42);
    }

    #[test]
    fn test_no_mutation_after_terminal() {
        let lc = RequestLifecycle::new("req_1".into());
        lc.set_endpoint("a", "main");
        lc.fail_request("auth_error", "401", 401);

        assert!(!lc.update_status(RequestStatus::Retry, 2, 0));
        lc.set_endpoint("b", "backup");
        lc.set_model("other-model");

        let snap = lc.snapshot();
        assert_eq!(snap.endpoint, "a");
        assert_eq!(snap.model, "");
        assert_eq!(snap.http_status, 401);
    }

    #[test]
    fn test_attempts_are_monotonic() {
        let lc = RequestLifecycle::new("req_1".into());
        assert_eq!(lc.increment_attempt(), 1);
        assert_eq!(lc.increment_attempt(), 2);
        assert_eq!(lc.attempt_count(), 2);

        lc.update_status(RequestStatus::Retry, 2, 0);
        lc.update_status(RequestStatus::Forwarding, 1, 0); // stale index ignored
        assert_eq!(lc.snapshot().attempts, 2);
    }

    #[test]
    fn test_tokens_attach_exactly_once() {
        let lc = RequestLifecycle::new("req_1".into());
        lc.record_tokens_for_failed_request(usage(7), "stream died");
        lc.record_tokens_for_failed_request(usage(99), "stream died again");
        lc.fail_request("stream_error", "reset", 207);

        let snap = lc.snapshot();
        assert_eq!(snap.tokens.unwrap().output_tokens, 7);
        assert_eq!(snap.http_status, 207);
    }

    #[test]
    fn test_cancel_keeps_tokens_so_far() {
        let lc = RequestLifecycle::new("req_1".into());
        assert!(lc.cancel_request("cancelled by client", Some(usage(3))));
        let snap = lc.snapshot();
        assert_eq!(snap.status, "cancelled");
        assert_eq!(snap.http_status, 499);
        assert_eq!(snap.tokens.unwrap().output_tokens, 3);
    }

    #[test]
    fn test_model_comparison_keeps_first_and_warns() {
        let lc = RequestLifecycle::new("req_1".into());
        lc.set_model_with_comparison("claude-3-5-sonnet", "request");
        lc.set_model_with_comparison("claude-3-5-haiku", "stream");
        assert_eq!(lc.snapshot().model, "claude-3-5-sonnet");
        assert!(lc.has_model());
    }

    #[test]
    fn test_model_from_tokens_fills_empty_slot() {
        let lc = RequestLifecycle::new("req_1".into());
        lc.complete_request(Some(usage(1)));
        assert_eq!(lc.snapshot().model, "claude-3-5-sonnet");
    }

    #[test]
    fn test_prepared_context_feeds_failure_reason() {
        let lc = RequestLifecycle::new("req_1".into());
        let err = ForwardError::Http {
            status: 429,
            body: String::new(),
        };
        let ctx = build_context("req_1", "a", "main", 1, 3, &err, None);
        lc.prepare_error_context(ctx);
        lc.handle_error("HTTP status 429");
        lc.fail_request("rate_limited", "exhausted", 429);

        assert_eq!(lc.snapshot().failure_reason, "rate_limited: exhausted");
    }

    #[test]
    fn test_timeout_terminal() {
        let lc = RequestLifecycle::new("req_1".into());
        assert!(lc.timeout_request("suspension wait expired"));
        let snap = lc.snapshot();
        assert_eq!(snap.status, "timeout");
        assert_eq!(snap.http_status, 502);
    }

    #[test]
    fn test_registry_creates_unique_ids_and_releases() {
        let reg = LifecycleRegistry::new();
        let a = reg.create();
        let b = reg.create();
        assert_ne!(a.id(), b.id());
        assert_eq!(reg.active_count(), 2);

        reg.release(a.id());
        assert_eq!(reg.active_count(), 1);
        assert_eq!(reg.snapshot_active()[0].request_id, b.id());
    }
}
