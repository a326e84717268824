use crate::error::ForwardError;
use crate::lifecycle::{LifecycleRegistry, RequestLifecycle};
use crate::proxy::classify::build_context;
use crate::proxy::context::{sse_response_builder, BoxBody};
use crate::proxy::sse::{LineAssembler, SseTokenParser};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel depth between the pump and the client body. Small on purpose —
/// upstream reads are paced by the client draining frames.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// HTTP status recorded on the lifecycle for a mid-stream failure: the
/// transport exchange succeeded even though the business stream did not.
/// Clients never see it — their status line was already sent.
const MID_STREAM_FAILURE_STATUS: u16 = 207;

/// Hand a successful upstream stream over to the client.
///
/// Returns immediately with an SSE response whose body is fed by a spawned
/// pump task. From this point on the attempt is past the
/// first-forwarded-byte line: every later failure is terminal (no endpoint
/// switch) and is signalled in-band with a `data: error:` sentinel.
pub(super) fn start_stream(
    lifecycles: Arc<LifecycleRegistry>,
    lifecycle: Arc<RequestLifecycle>,
    cancel: CancellationToken,
    resp: reqwest::Response,
) -> hyper::Response<BoxBody> {
    let status = resp.status();
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, hyper::Error>>(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(pump(lifecycles, lifecycle, cancel, resp, tx));

    let stream =
        futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    let body = BodyExt::boxed(StreamBody::new(stream));

    sse_response_builder(status)
        .body(body)
        .expect("sse stream response must build")
}

enum PumpEnd {
    /// Upstream closed the stream normally.
    Done,
    /// The inbound caller cancelled.
    Cancelled,
    /// The client stopped reading (response body dropped).
    ClientGone,
    /// Upstream failed mid-stream.
    Upstream(String),
}

async fn pump(
    lifecycles: Arc<LifecycleRegistry>,
    lifecycle: Arc<RequestLifecycle>,
    cancel: CancellationToken,
    resp: reqwest::Response,
    tx: mpsc::Sender<Result<Frame<Bytes>, hyper::Error>>,
) {
    let mut parser = SseTokenParser::new();
    let mut assembler = LineAssembler::new();
    let mut model_reported = false;
    let mut bytes_forwarded: u64 = 0;
    let mut upstream = resp.bytes_stream();

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Cancelled,

            chunk = upstream.next() => match chunk {
                None => break PumpEnd::Done,
                Some(Ok(bytes)) => {
                    assembler.push(&bytes, |line| parser.feed_line(line));

                    if !model_reported {
                        if let Some(model) = parser.model() {
                            lifecycle.set_model_with_comparison(model, "stream");
                            model_reported = true;
                        }
                    }

                    bytes_forwarded += bytes.len() as u64;
                    if tx.send(Ok(Frame::data(bytes))).await.is_err() {
                        break PumpEnd::ClientGone;
                    }
                }
                Some(Err(e)) => break PumpEnd::Upstream(e.to_string()),
            },
        }
    };

    match end {
        PumpEnd::Done => {
            let usage = parser.usage();
            if parser.skipped_lines() > 0 {
                debug!(
                    "proxy: stream finished with unparseable data lines, request_id={}, skipped={}",
                    lifecycle.id(),
                    parser.skipped_lines()
                );
            }
            lifecycle.complete_request(usage);
            info!(
                "proxy: stream completed, request_id={}, bytes={}",
                lifecycle.id(),
                bytes_forwarded
            );
        }
        PumpEnd::Cancelled => {
            let _ = tx
                .send(Ok(Frame::data(Bytes::from_static(
                    b"data: cancelled: request cancelled by client\n\n",
                ))))
                .await;
            lifecycle.cancel_request("cancelled by client", parser.usage());
            info!(
                "proxy: stream cancelled by client, request_id={}, bytes={}",
                lifecycle.id(),
                bytes_forwarded
            );
        }
        PumpEnd::ClientGone => {
            lifecycle.cancel_request("client disconnected", parser.usage());
            info!(
                "proxy: stream client went away, request_id={}, bytes={}",
                lifecycle.id(),
                bytes_forwarded
            );
        }
        PumpEnd::Upstream(message) => {
            if let Some(usage) = parser.usage() {
                lifecycle.record_tokens_for_failed_request(usage, "stream interrupted");
            }
            // Bytes already reached the client, so this is terminal by
            // definition; the classifier still derives the recorded reason.
            let err = ForwardError::Stream(message);
            let snapshot = lifecycle.snapshot();
            let ec = build_context(
                lifecycle.id(),
                &snapshot.endpoint,
                &snapshot.group,
                snapshot.attempts,
                snapshot.attempts,
                &err,
                None,
            );
            lifecycle.prepare_error_context(ec.clone());
            lifecycle.handle_error(&ec.message);
            lifecycle.fail_request("stream_error", &ec.message, MID_STREAM_FAILURE_STATUS);
            let sentinel = format!("data: error: {}\n\n", ec.reason());
            let _ = tx.send(Ok(Frame::data(Bytes::from(sentinel)))).await;
            warn!(
                "proxy: stream interrupted, request_id={}, bytes={}, error={}",
                lifecycle.id(),
                bytes_forwarded,
                ec.message
            );
            metrics::counter!("relay_stream_errors_total").increment(1);
        }
    }

    let snapshot = lifecycle.snapshot();
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
        "kind" => "streaming",
        "status" => snapshot.status,
    )
    .increment(1);

    lifecycles.release(lifecycle.id());
}
