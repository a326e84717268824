use super::RelayState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: u16, body: impl Into<Bytes>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("admin response must build")
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: RelayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let is_post = req.method() == Method::POST;

    match path.as_str() {
        "/health" | "/healthz" => Ok(json_response(200, r#"{"status":"ok"}"#)),

        "/ready" | "/readyz" => {
            let snapshot = state.registry.snapshot();
            let healthy = snapshot
                .iter()
                .filter(|ep| ep.healthy || ep.never_checked)
                .count();
            Ok(json_response(
                200,
                format!(
                    r#"{{"status":"ready","endpoints":{},"usable":{},"active_requests":{}}}"#,
                    snapshot.len(),
                    healthy,
                    state.lifecycles.active_count(),
                ),
            ))
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .expect("metrics response must build"))
        }

        "/endpoints" => {
            let body = serde_json::to_string_pretty(&state.registry.snapshot())
                .unwrap_or_default();
            Ok(json_response(200, body))
        }

        "/groups" => {
            let body =
                serde_json::to_string_pretty(&state.groups.snapshot()).unwrap_or_default();
            Ok(json_response(200, body))
        }

        "/requests" => {
            let body = serde_json::to_string_pretty(&state.lifecycles.snapshot_active())
                .unwrap_or_default();
            Ok(json_response(200, body))
        }

        // ---- Control operations (POST only) ----

        "/groups/activate" | "/groups/resume" | "/groups/pause" | "/groups/force-activate" => {
            if !is_post {
                return Ok(json_response(405, r#"{"error":"method not allowed"}"#));
            }
            let Some(name) = query_param(req.uri().query(), "name") else {
                return Ok(json_response(400, r#"{"error":"missing name parameter"}"#));
            };
            let ok = match path.as_str() {
                "/groups/activate" => state.groups.activate(&name),
                "/groups/resume" => state.groups.resume(&name),
                "/groups/pause" => state.groups.pause(&name),
                _ => state.groups.force_activate(&name),
            };
            if ok {
                Ok(json_response(200, format!(r#"{{"ok":true,"group":"{}"}}"#, name)))
            } else {
                Ok(json_response(409, format!(r#"{{"ok":false,"group":"{}"}}"#, name)))
            }
        }

        "/endpoints/priority" => {
            if !is_post {
                return Ok(json_response(405, r#"{"error":"method not allowed"}"#));
            }
            let query = req.uri().query();
            let (Some(name), Some(priority)) = (
                query_param(query, "name"),
                query_param(query, "priority").and_then(|v| v.parse::<u32>().ok()),
            ) else {
                return Ok(json_response(
                    400,
                    r#"{"error":"missing name or priority parameter"}"#,
                ));
            };
            if state.registry.update_priority(&name, priority) {
                Ok(json_response(200, format!(r#"{{"ok":true,"endpoint":"{}"}}"#, name)))
            } else {
                Ok(json_response(404, format!(r#"{{"ok":false,"endpoint":"{}"}}"#, name)))
            }
        }

        _ => Ok(json_response(404, r#"{"error":"not found"}"#)),
    }
}

/// Minimal query-string lookup; values are percent-decoding-free by design —
/// group and endpoint names are plain identifiers.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::query_param;

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("name=backup&priority=2"), "name").as_deref(),
            Some("backup")
        );
        assert_eq!(
            query_param(Some("name=backup&priority=2"), "priority").as_deref(),
            Some("2")
        );
        assert_eq!(query_param(Some("name=backup"), "missing"), None);
        assert_eq!(query_param(None, "name"), None);
    }
}
