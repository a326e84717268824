use crate::error::ForwardError;
use crate::lifecycle::RequestLifecycle;
use crate::proxy::context::{error_response, full_body, BoxBody};
use crate::proxy::sse::parse_unary_usage;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::StatusCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Finish a successful unary forward: buffer the upstream body, transparently
/// decode gzip, extract the token-usage record (synchronously — the terminal
/// lifecycle transition must not race a background parse), and mirror the
/// response to the client without the `Content-Encoding` header.
pub(super) async fn complete_unary(
    lifecycle: &Arc<RequestLifecycle>,
    cancel: &CancellationToken,
    resp: reqwest::Response,
) -> hyper::Response<BoxBody> {
    let status = resp.status();
    let upstream_headers = resp.headers().clone();
    let is_gzip = upstream_headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    let body = tokio::select! {
        _ = cancel.cancelled() => {
            lifecycle.cancel_request("cancelled by client", None);
            return error_response(StatusCode::from_u16(499).expect("499 is valid"), Bytes::new());
        }
        result = resp.bytes() => match result {
            Ok(body) => body,
            Err(e) => {
                let err = ForwardError::Body(format!("upstream body read failed: {}", e));
                lifecycle.fail_request("error", &err.to_string(), 502);
                return error_response(StatusCode::BAD_GATEWAY, "upstream body read failed");
            }
        },
    };

    let body = if is_gzip {
        match gunzip(&body).await {
            Ok(decoded) => decoded,
            Err(e) => {
                let err = ForwardError::Body(format!("gzip decode failed: {}", e));
                lifecycle.fail_request("error", &err.to_string(), 502);
                return error_response(StatusCode::BAD_GATEWAY, "upstream body decode failed");
            }
        }
    } else {
        body
    };

    // Token analysis happens inline; a tokenless body still completes.
    let text = String::from_utf8_lossy(&body);
    match parse_unary_usage(&text) {
        Some(usage) => {
            if let Some(ref model) = usage.model {
                lifecycle.set_model_with_comparison(model, "response");
            }
            lifecycle.complete_request(Some(usage));
        }
        None => {
            lifecycle.handle_non_token_response(&text);
        }
    }

    let mut builder = hyper::Response::builder().status(status);
    for (name, value) in &upstream_headers {
        // Content-Encoding is dropped because the body was decoded here;
        // length and framing are recomputed for the new body.
        if *name == CONTENT_ENCODING && is_gzip {
            continue;
        }
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING || *name == CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }

    debug!(
        "proxy: unary response mirrored, request_id={}, status={}, bytes={}",
        lifecycle.id(),
        status.as_u16(),
        body.len()
    );

    match builder.body(full_body(body)) {
        Ok(resp) => resp,
        Err(e) => error_response(
            StatusCode::BAD_GATEWAY,
            format!("response assembly failed: {}", e),
        ),
    }
}

async fn gunzip(body: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(body);
    let mut decoded = Vec::with_capacity(body.len().saturating_mul(4));
    decoder.read_to_end(&mut decoded).await?;
    Ok(Bytes::from(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gunzip_round() {
        use async_compression::tokio::bufread::GzipEncoder;

        let plain = br#"{"usage":{"input_tokens":1,"output_tokens":2}}"#;
        let mut encoder = GzipEncoder::new(&plain[..]);
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();

        let decoded = gunzip(&compressed).await.unwrap();
        assert_eq!(&decoded[..], plain);
    }

    #[tokio::test]
    async fn test_gunzip_rejects_garbage() {
        assert!(gunzip(b"definitely not gzip").await.is_err());
    }
}
