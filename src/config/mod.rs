pub mod types;


pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl RelayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used — an empty endpoint set fails
    /// validation, so a real deployment always carries a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: RelayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            RelayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            "config: loaded, endpoints={}, groups={}",
            config.endpoints.len(),
            config.group_names().len(),
        );
        Ok(config)
    }

    /// Apply environment variable overrides for infrastructure settings.
    /// Endpoint definitions always come from the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAY_OUTBOUND_PROXY") {
            if v.is_empty() {
                self.transport.proxy = None;
            } else {
                self.transport.proxy = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAY_TLS_VERIFY") {
            self.transport.tls_verify = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("RELAY_HEALTH_CHECK_INTERVAL") {
            if let Ok(n) = v.parse::<f64>() {
                self.health_check.interval = n;
            }
        }
        if let Ok(v) = std::env::var("RELAY_SUSPENSION_ENABLED") {
            self.suspension.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("RELAY_AUTO_SWITCH") {
            self.groups.auto_switch_between_groups = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("at least one endpoint must be configured");
        }

        let mut names = HashSet::new();
        for ep in &self.endpoints {
            if ep.name.is_empty() {
                anyhow::bail!("endpoint name cannot be empty");
            }
            if !names.insert(ep.name.as_str()) {
                anyhow::bail!("duplicate endpoint name: {}", ep.name);
            }
            let url = reqwest::Url::parse(&ep.url)
                .map_err(|e| anyhow::anyhow!("endpoint {}: invalid url {}: {}", ep.name, ep.url, e))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                anyhow::bail!("endpoint {}: unsupported url scheme {}", ep.name, url.scheme());
            }
            if ep.timeout <= 0.0 {
                anyhow::bail!("endpoint {}: timeout must be positive", ep.name);
            }
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            anyhow::bail!("retry.multiplier must be >= 1.0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
        }

        if self.suspension.enabled && self.suspension.max_suspended_requests == 0 {
            anyhow::bail!("suspension.max_suspended_requests must be at least 1 when enabled");
        }

        if !matches!(self.selection.strategy.as_str(), "priority" | "fastest") {
            anyhow::bail!(
                "selection.strategy must be \"priority\" or \"fastest\", got {:?}",
                self.selection.strategy
            );
        }

        if let Some(ref proxy) = self.transport.proxy {
            reqwest::Url::parse(proxy)
                .map_err(|e| anyhow::anyhow!("transport.proxy: invalid url {}: {}", proxy, e))?;
        }

        Ok(())
    }

    /// Distinct group names in endpoint-declaration order.
    pub fn group_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.endpoints
            .iter()
            .filter(|ep| seen.insert(ep.group.as_str()))
            .map(|ep| ep.group.clone())
            .collect()
    }
}
