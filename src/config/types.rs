use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream provider endpoints.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    pub groups: GroupSettings,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub suspension: SuspensionConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub selection: SelectionConfig,
}

/// A single upstream provider endpoint.
///
/// Endpoints belong to named groups; the group with the numerically smallest
/// `group_priority` is preferred, and within a group the endpoint with the
/// smallest `priority` is tried first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,

    /// Base URL, e.g. `https://api.example.com`. Inbound path and query are
    /// appended verbatim.
    pub url: String,

    /// Smaller = higher priority within the group.
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_group")]
    pub group: String,

    /// Smaller = higher priority across groups.
    #[serde(default)]
    pub group_priority: u32,

    /// Per-request timeout for unary forwards (seconds). Streaming forwards
    /// use `streaming.response_header_timeout` instead.
    #[serde(default = "default_endpoint_timeout")]
    pub timeout: f64,

    /// Bearer token injected as `Authorization: Bearer <token>`.
    #[serde(default)]
    pub token: String,

    /// Optional value injected as `X-Api-Key`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Custom headers applied last, after auth injection.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_endpoint_timeout() -> f64 {
    300.0
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// Group switching behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    /// `true`: all non-paused, non-cooling groups serve traffic concurrently.
    /// `false` (manual): exactly the operator-activated group serves traffic
    /// and exhausted requests may suspend waiting for a group switch.
    #[serde(default = "default_auto_switch")]
    pub auto_switch_between_groups: bool,

    /// How long a fully-failed group is suppressed before becoming eligible
    /// again (seconds).
    #[serde(default = "default_cooldown")]
    pub cooldown: f64,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            auto_switch_between_groups: default_auto_switch(),
            cooldown: default_cooldown(),
        }
    }
}

fn default_auto_switch() -> bool {
    true
}

fn default_cooldown() -> f64 {
    600.0
}

impl GroupSettings {
    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown)
    }
}

/// Same-endpoint retry behavior with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts against one endpoint before switching to the next.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Bounded request suspension while waiting for a group or endpoint recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspensionConfig {
    #[serde(default = "default_suspension_enabled")]
    pub enabled: bool,

    /// Global cap on concurrently suspended requests.
    #[serde(default = "default_max_suspended")]
    pub max_suspended_requests: usize,

    /// Per-request suspension deadline (seconds).
    #[serde(default = "default_suspension_timeout")]
    pub timeout: f64,
}

impl Default for SuspensionConfig {
    fn default() -> Self {
        Self {
            enabled: default_suspension_enabled(),
            max_suspended_requests: default_max_suspended(),
            timeout: default_suspension_timeout(),
        }
    }
}

fn default_suspension_enabled() -> bool {
    true
}

fn default_max_suspended() -> usize {
    100
}

fn default_suspension_timeout() -> f64 {
    300.0
}

impl SuspensionConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// Streaming (SSE) forward behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// How long to wait for upstream response headers before a streaming
    /// attempt is considered failed (seconds). There is deliberately no
    /// overall deadline on the stream body itself.
    #[serde(default = "default_response_header_timeout")]
    pub response_header_timeout: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            response_header_timeout: default_response_header_timeout(),
        }
    }
}

fn default_response_header_timeout() -> f64 {
    30.0
}

impl StreamingConfig {
    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.response_header_timeout)
    }
}

/// Periodic active health checking of endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Seconds between check rounds.
    #[serde(default = "default_health_interval")]
    pub interval: f64,

    /// Probe path appended to each endpoint's base URL.
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Per-probe timeout (seconds).
    #[serde(default = "default_health_timeout")]
    pub timeout: f64,

    /// Ceiling on concurrent probes per round, regardless of endpoint count.
    #[serde(default = "default_health_concurrency")]
    pub concurrency: usize,

    /// Treat endpoints that have never completed a probe as eligible
    /// candidates. Disable to force a passing probe before first use.
    #[serde(default = "default_allow_unchecked")]
    pub allow_unchecked: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            path: default_health_path(),
            timeout: default_health_timeout(),
            concurrency: default_health_concurrency(),
            allow_unchecked: default_allow_unchecked(),
        }
    }
}

fn default_health_interval() -> f64 {
    30.0
}

fn default_health_path() -> String {
    "/v1/models".to_string()
}

fn default_health_timeout() -> f64 {
    5.0
}

fn default_health_concurrency() -> usize {
    8
}

fn default_allow_unchecked() -> bool {
    true
}

impl HealthCheckConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// Outbound transport construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,

    /// Connection pool idle timeout (seconds).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Max idle pooled connections per upstream host.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Optional outbound forward proxy, e.g. `http://127.0.0.1:7890`.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Default `true` — disable only for upstreams with self-signed certs.
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            pool_size: default_pool_size(),
            proxy: None,
            tls_verify: default_tls_verify(),
        }
    }
}

fn default_connect_timeout() -> f64 {
    6.0
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    32
}

fn default_tls_verify() -> bool {
    true
}

impl TransportConfig {
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout)
    }
}

/// Candidate ordering strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// "priority" (static ordering) or "fastest" (real-time latency probe
    /// reorders candidates per lookup).
    #[serde(default = "default_selection_strategy")]
    pub strategy: String,

    /// Overall deadline for the fastest-mode probe round (seconds). On
    /// expiry the lookup falls back to priority ordering.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: f64,

    /// Path used by the fastest-mode probe.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: default_selection_strategy(),
            probe_timeout: default_probe_timeout(),
            probe_path: default_probe_path(),
        }
    }
}

fn default_selection_strategy() -> String {
    "priority".to_string()
}

fn default_probe_timeout() -> f64 {
    1.5
}

fn default_probe_path() -> String {
    "/".to_string()
}

impl SelectionConfig {
    pub fn is_fastest(&self) -> bool {
        self.strategy == "fastest"
    }

    pub fn probe_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout)
    }
}
