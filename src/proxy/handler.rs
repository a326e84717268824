use crate::error::ForwardError;
use crate::lifecycle::{LifecycleRegistry, RequestLifecycle, RequestStatus};
use crate::proxy::classify::{build_context, is_success};
use crate::proxy::context::{
    error_response, full_body, sse_sentinel_response, BoxBody, InboundRequest,
};
use crate::proxy::policy::FinalStatus;
use crate::proxy::sse::parse_unary_usage;
use crate::proxy::{streaming, unary};
use crate::server::RelayState;
use crate::suspend::SuspendOutcome;
use bytes::Bytes;
use http::header::{ACCEPT, RETRY_AFTER};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upstream error bodies are kept only as far as token extraction and
/// diagnostics need them.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayMode {
    Unary,
    Streaming,
}

/// Entry point for one inbound request: buffer the body, create the
/// lifecycle, pick the handler mode, and run the forwarding engine.
pub async fn handle_request(
    req: Request<Incoming>,
    state: RelayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();

    // The body is read exactly once; every retry replays these bytes.
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy: failed to read inbound body, error={}", e);
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ));
        }
    };

    let inbound = InboundRequest {
        method: parts.method,
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned()),
        headers: parts.headers,
    };

    let (model, stream_flag) = introspect_body(&body);
    let accept_sse = inbound
        .headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);
    let mode = if stream_flag || accept_sse {
        RelayMode::Streaming
    } else {
        RelayMode::Unary
    };

    let lifecycle = state.lifecycles.create();
    if let Some(ref model) = model {
        lifecycle.set_model_with_comparison(model, "request");
    }

    info!(
        "proxy: request accepted, request_id={}, method={}, path={}, mode={}",
        lifecycle.id(),
        inbound.method,
        inbound.path_and_query,
        match mode {
            RelayMode::Unary => "unary",
            RelayMode::Streaming => "streaming",
        },
    );

    // Engine-level cancellation follows server shutdown; a dropped dispatch
    // future (client disconnect) is resolved by the guard instead.
    let cancel = state.shutdown.child_token();
    let stream_handoff = Arc::new(AtomicBool::new(false));
    let _guard = DispatchGuard {
        lifecycles: state.lifecycles.clone(),
        lifecycle: lifecycle.clone(),
        stream_handoff: stream_handoff.clone(),
        kind: match mode {
            RelayMode::Unary => "unary",
            RelayMode::Streaming => "streaming",
        },
    };

    let response = run_relay(
        &state,
        &cancel,
        &inbound,
        body,
        &lifecycle,
        mode,
        &stream_handoff,
    )
    .await;

    Ok(response)
}

/// Finalizes lifecycle bookkeeping on every dispatch exit path, including a
/// dropped future when the client goes away mid-processing. A streaming
/// handoff disarms it — the pump task owns the rest of the lifecycle.
struct DispatchGuard {
    lifecycles: Arc<LifecycleRegistry>,
    lifecycle: Arc<RequestLifecycle>,
    stream_handoff: Arc<AtomicBool>,
    kind: &'static str,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if self.stream_handoff.load(Ordering::Acquire) {
            return;
        }
        if !self.lifecycle.is_terminal() {
            self.lifecycle.cancel_request("client disconnected", None);
        }

        let snapshot = self.lifecycle.snapshot();
        info!(
            request_id = %snapshot.request_id,
            endpoint = %snapshot.endpoint,
            group = %snapshot.group,
            model = %snapshot.model,
            status = snapshot.status,
            http_status = snapshot.http_status,
            attempts = snapshot.attempts,
            latency_ms = snapshot.elapsed_ms,
            "access"
        );
        metrics::counter!(
            "relay_requests_total",
            "kind" => self.kind,
            "status" => snapshot.status,
        )
        .increment(1);

        self.lifecycles.release(self.lifecycle.id());
    }
}

/// The retry engine shared by both handler modes. Walks ordered candidates,
/// drives per-endpoint attempts through the retry policy, and resolves
/// suspension, group cool-down, and the permissive no-healthy fallback.
#[allow(clippy::too_many_arguments)]
async fn run_relay(
    state: &RelayState,
    cancel: &CancellationToken,
    inbound: &InboundRequest,
    body: Bytes,
    lifecycle: &Arc<RequestLifecycle>,
    mode: RelayMode,
    stream_handoff: &Arc<AtomicBool>,
) -> Response<BoxBody> {
    let is_streaming = mode == RelayMode::Streaming;
    let max_attempts = state.policy.max_attempts();
    let cooldown = state.config.groups.cooldown_duration();

    // Groups this request already burned; they are never reselected here
    // even if their cool-down elapses mid-request.
    let mut cooled: HashSet<String> = HashSet::new();
    let mut exhausted_as = FinalStatus::Error;

    'outer: loop {
        let mut candidates = state.registry.candidates(&state.groups).await;
        candidates.retain(|ep| !cooled.contains(&ep.group));

        if candidates.is_empty() {
            // Relaxed fallback: every endpoint of the active groups,
            // regardless of health.
            let mut relaxed = state.registry.all_in_active_groups(&state.groups);
            relaxed.retain(|ep| !cooled.contains(&ep.group));

            if relaxed.is_empty() {
                let err = ForwardError::NoHealthyEndpoints;
                let ec = build_context(lifecycle.id(), "", "", 0, max_attempts, &err, None);
                lifecycle.prepare_error_context(ec.clone());
                lifecycle.handle_error(&ec.message);
                let decision =
                    state
                        .policy
                        .decide(&ec, 1, lifecycle.attempt_count().max(1), is_streaming);

                if decision.suspend_request && state.suspension.should_suspend() {
                    match suspend_and_wait(state, cancel, lifecycle, None).await {
                        SuspendOutcome::Recovered => continue 'outer,
                        SuspendOutcome::Cancelled => return reply_cancelled(mode, lifecycle),
                        SuspendOutcome::TimedOut | SuspendOutcome::Rejected => {
                            return reply_suspend_timeout(mode, lifecycle)
                        }
                    }
                }

                lifecycle.fail_request("error", "no healthy endpoints available", 503);
                return reply_error(mode, 503, "No healthy endpoints available");
            }

            warn!(
                "proxy: no healthy candidates, falling back to all active-group endpoints, request_id={}, relaxed={}",
                lifecycle.id(),
                relaxed.len()
            );
            candidates = relaxed;
        }

        for endpoint in &candidates {
            lifecycle.set_endpoint(&endpoint.name, &endpoint.group);
            lifecycle.update_status(RequestStatus::Forwarding, lifecycle.attempt_count(), 0);

            let mut local_attempt = 0u32;
            loop {
                local_attempt += 1;
                if cancel.is_cancelled() {
                    return reply_cancelled(mode, lifecycle);
                }
                let global_attempt = lifecycle.increment_attempt();

                let result = match mode {
                    RelayMode::Unary => {
                        state
                            .forwarder
                            .forward_unary(cancel, inbound, &body, endpoint)
                            .await
                    }
                    RelayMode::Streaming => {
                        state
                            .forwarder
                            .forward_streaming(cancel, inbound, &body, endpoint)
                            .await
                    }
                };

                let (err, retry_after) = match result {
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        if is_success(status) {
                            lifecycle.update_status(
                                RequestStatus::Processing,
                                global_attempt,
                                status,
                            );
                            return match mode {
                                RelayMode::Unary => {
                                    unary::complete_unary(lifecycle, cancel, resp).await
                                }
                                RelayMode::Streaming => {
                                    stream_handoff.store(true, Ordering::Release);
                                    streaming::start_stream(
                                        state.lifecycles.clone(),
                                        lifecycle.clone(),
                                        cancel.clone(),
                                        resp,
                                    )
                                }
                            };
                        }
                        http_error_from(resp, lifecycle).await
                    }
                    Err(ForwardError::Cancelled) => return reply_cancelled(mode, lifecycle),
                    Err(e) => (e, None),
                };

                let ec = build_context(
                    lifecycle.id(),
                    &endpoint.name,
                    &endpoint.group,
                    local_attempt,
                    max_attempts,
                    &err,
                    retry_after,
                );
                warn!(
                    "proxy: attempt failed, request_id={}, endpoint={}, attempt={}/{}, kind={}, error={}",
                    lifecycle.id(),
                    endpoint.name,
                    local_attempt,
                    max_attempts,
                    ec.kind.as_str(),
                    ec.message
                );
                lifecycle.prepare_error_context(ec.clone());
                lifecycle.handle_error(&ec.message);

                let decision = state
                    .policy
                    .decide(&ec, local_attempt, global_attempt, is_streaming);

                if decision.suspend_request && state.suspension.should_suspend() {
                    match suspend_and_wait(state, cancel, lifecycle, Some(&endpoint.name)).await {
                        SuspendOutcome::Recovered => continue 'outer,
                        SuspendOutcome::Cancelled => return reply_cancelled(mode, lifecycle),
                        SuspendOutcome::TimedOut | SuspendOutcome::Rejected => {
                            return reply_suspend_timeout(mode, lifecycle)
                        }
                    }
                }

                if !decision.retry_same_endpoint {
                    if decision.switch_endpoint {
                        if decision.final_status != FinalStatus::None {
                            exhausted_as = decision.final_status;
                        }
                        metrics::counter!(
                            "relay_endpoint_switches_total",
                            "from" => endpoint.name.clone(),
                        )
                        .increment(1);
                        debug!(
                            "proxy: switching endpoint, request_id={}, from={}, reason={}",
                            lifecycle.id(),
                            endpoint.name,
                            decision.reason
                        );
                        break;
                    }

                    // Terminal.
                    let status_code = ec
                        .http_status
                        .unwrap_or_else(|| decision.final_status.fallback_http_status());
                    if decision.final_status == FinalStatus::Cancelled {
                        return reply_cancelled(mode, lifecycle);
                    }
                    lifecycle.fail_request(
                        decision.final_status.as_str(),
                        &decision.reason,
                        status_code,
                    );
                    return reply_terminal(mode, status_code, &err, &decision.reason);
                }

                if !decision.delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return reply_cancelled(mode, lifecycle),
                        _ = tokio::time::sleep(decision.delay) => {}
                    }
                }
                metrics::counter!(
                    "relay_upstream_retries_total",
                    "endpoint" => endpoint.name.clone(),
                )
                .increment(1);
                lifecycle.update_status(RequestStatus::Retry, global_attempt, 0);
            }
        }

        // Every candidate in this pass failed. The burned groups enter
        // cool-down so the next pass (and concurrent requests) prefer others.
        let mut burned: Vec<String> = Vec::new();
        for endpoint in &candidates {
            if !burned.contains(&endpoint.group) {
                burned.push(endpoint.group.clone());
            }
        }
        for group in burned {
            state.groups.cool_down(&group, cooldown);
            cooled.insert(group);
        }

        if state.suspension.should_suspend() {
            match suspend_and_wait(state, cancel, lifecycle, None).await {
                SuspendOutcome::Recovered => continue 'outer,
                SuspendOutcome::Cancelled => return reply_cancelled(mode, lifecycle),
                SuspendOutcome::TimedOut | SuspendOutcome::Rejected => {
                    return reply_suspend_timeout(mode, lifecycle)
                }
            }
        }
        break;
    }

    let status_code = exhausted_as.fallback_http_status();
    let message = match exhausted_as {
        FinalStatus::RateLimited => "All endpoints rate limited",
        _ => "All endpoints failed",
    };
    let reason = if exhausted_as == FinalStatus::RateLimited {
        "rate_limited"
    } else {
        "error"
    };
    lifecycle.fail_request(reason, message, status_code);
    reply_error(mode, status_code, message)
}

async fn suspend_and_wait(
    state: &RelayState,
    cancel: &CancellationToken,
    lifecycle: &Arc<RequestLifecycle>,
    last_failed_endpoint: Option<&str>,
) -> SuspendOutcome {
    lifecycle.update_status(RequestStatus::Suspended, lifecycle.attempt_count(), 0);
    state
        .suspension
        .wait_for_endpoint_recovery(cancel, lifecycle.id(), last_failed_endpoint)
        .await
}

/// Consume a non-success upstream response into a forward error, capturing
/// the Retry-After hint and any usage record embedded in 429/413/5xx error
/// payloads.
async fn http_error_from(
    resp: reqwest::Response,
    lifecycle: &Arc<RequestLifecycle>,
) -> (ForwardError, Option<Duration>) {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = match tokio::time::timeout(Duration::from_secs(5), resp.bytes()).await {
        Ok(Ok(bytes)) => {
            let end = bytes.len().min(MAX_ERROR_BODY_BYTES);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
        _ => String::new(),
    };

    if (matches!(status, 413 | 429) || status >= 500) && !body.is_empty() {
        if let Some(usage) = parse_unary_usage(&body) {
            lifecycle.record_tokens_for_failed_request(usage, "usage attached to error response");
        }
    }

    (ForwardError::Http { status, body }, retry_after)
}

// ---- Terminal replies ----

fn reply_cancelled(mode: RelayMode, lifecycle: &Arc<RequestLifecycle>) -> Response<BoxBody> {
    lifecycle.cancel_request("cancelled by client", None);
    let status = StatusCode::from_u16(499).expect("499 is a valid status");
    match mode {
        RelayMode::Unary => {
            let mut resp = Response::new(full_body(Bytes::new()));
            *resp.status_mut() = status;
            resp
        }
        RelayMode::Streaming => {
            sse_sentinel_response(status, "data: cancelled: request cancelled by client")
        }
    }
}

fn reply_suspend_timeout(mode: RelayMode, lifecycle: &Arc<RequestLifecycle>) -> Response<BoxBody> {
    lifecycle.timeout_request("suspension wait timed out");
    match mode {
        RelayMode::Unary => error_response(StatusCode::BAD_GATEWAY, "suspension wait timed out"),
        RelayMode::Streaming => {
            sse_sentinel_response(StatusCode::BAD_GATEWAY, "data: error: 挂起等待超时")
        }
    }
}

fn reply_error(mode: RelayMode, status: u16, message: &str) -> Response<BoxBody> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    match mode {
        RelayMode::Unary => error_response(status, message.to_owned()),
        RelayMode::Streaming => {
            sse_sentinel_response(status, &format!("data: error: {}", message))
        }
    }
}

/// Terminal reply for a policy decision: unary callers get the upstream
/// error body verbatim when one was captured, streaming callers get the
/// in-band sentinel.
fn reply_terminal(
    mode: RelayMode,
    status: u16,
    err: &ForwardError,
    reason: &str,
) -> Response<BoxBody> {
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    match mode {
        RelayMode::Unary => match err {
            ForwardError::Http { body, .. } if !body.is_empty() => {
                error_response(status_code, body.clone())
            }
            _ => error_response(status_code, reason.to_owned()),
        },
        RelayMode::Streaming => {
            sse_sentinel_response(status_code, &format!("data: error: {}", reason))
        }
    }
}

/// Best-effort peek into the inbound JSON body for the requested model and
/// the streaming flag. Non-JSON bodies are forwarded untouched.
fn introspect_body(body: &[u8]) -> (Option<String>, bool) {
    if body.is_empty() {
        return (None, false);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => {
            let model = value
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string);
            let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
            (model, stream)
        }
        Err(_) => (None, false),
    }
}
