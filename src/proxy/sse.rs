use crate::lifecycle::TokenUsage;
use serde_json::Value;
use tracing::debug;

/// Incremental parser for token-usage records embedded in an SSE stream.
///
/// Consumes `data:` lines and accumulates the usage fields the provider
/// reports: `message_start` carries the input-side totals (and the model
/// name), `message_delta` carries the cumulative output total. Anything
/// malformed is skipped — a broken upstream payload never fails the relay.
#[derive(Debug, Default)]
pub struct SseTokenParser {
    usage: TokenUsage,
    saw_usage: bool,
    skipped_lines: u64,
}

impl SseTokenParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of the stream (without its trailing newline).
    pub fn feed_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
            return;
        };
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                self.skipped_lines += 1;
                debug!("sse: unparseable data line skipped, error={}", e);
                return;
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let message = value.get("message").unwrap_or(&Value::Null);
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    self.usage.model = Some(model.to_string());
                }
                if let Some(usage) = message.get("usage") {
                    self.merge_usage(usage);
                }
            }
            // Cumulative output count rides on every delta; the last one wins.
            Some("message_delta") => {
                if let Some(usage) = value.get("usage") {
                    self.merge_usage(usage);
                }
            }
            _ => {
                // Some providers attach usage to other event types.
                if let Some(usage) = value.get("usage") {
                    self.merge_usage(usage);
                }
            }
        }
    }

    fn merge_usage(&mut self, usage: &Value) {
        let mut merge = |key: &str, slot: &mut u64| {
            if let Some(n) = usage.get(key).and_then(Value::as_u64) {
                *slot = n;
                self.saw_usage = true;
            }
        };
        merge("input_tokens", &mut self.usage.input_tokens);
        merge("output_tokens", &mut self.usage.output_tokens);
        merge("cache_creation_input_tokens", &mut self.usage.cache_creation_tokens);
        merge("cache_read_input_tokens", &mut self.usage.cache_read_tokens);
    }

    /// Model name learned from `message_start`, if any.
    pub fn model(&self) -> Option<&str> {
        self.usage.model.as_deref()
    }

    /// The accumulated usage, or `None` when the stream never produced a
    /// usage record.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.saw_usage.then(|| self.usage.clone())
    }

    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }
}

/// Extract a usage record from a complete (unary) JSON response body.
/// Returns `None` for non-JSON or token-free payloads.
pub fn parse_unary_usage(body: &str) -> Option<TokenUsage> {
    let value: Value = serde_json::from_str(body).ok()?;
    let usage = value.get("usage")?;

    let mut tokens = TokenUsage {
        model: value
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
        ..TokenUsage::default()
    };

    let mut found = false;
    let mut read = |key: &str, slot: &mut u64| {
        if let Some(n) = usage.get(key).and_then(Value::as_u64) {
            *slot = n;
            found = true;
        }
    };
    read("input_tokens", &mut tokens.input_tokens);
    read("output_tokens", &mut tokens.output_tokens);
    read("cache_creation_input_tokens", &mut tokens.cache_creation_tokens);
    read("cache_read_input_tokens", &mut tokens.cache_read_tokens);

    found.then_some(tokens)
}

/// Splits arbitrary byte chunks into complete lines for the parser while the
/// raw bytes are forwarded to the client untouched.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one chunk; invokes `on_line` for every completed line, without
    /// the trailing `\n` (or `\r\n`).
    pub fn push(&mut self, chunk: &[u8], mut on_line: impl FnMut(&str)) {
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Ok(text) = std::str::from_utf8(&line) {
                on_line(text);
            }
        }
    }
}
