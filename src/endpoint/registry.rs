use crate::config::{EndpointConfig, HealthCheckConfig, SelectionConfig};
use crate::group::GroupManager;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RECOVERY_CHANNEL_CAPACITY: usize = 4;

/// Immutable per-endpoint definition. Runtime health lives separately in the
/// registry so that priority updates can swap definitions without touching
/// health history.
#[derive(Debug)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub priority: u32,
    pub group: String,
    pub group_priority: u32,
    pub timeout: Duration,
    pub token: String,
    pub api_key: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Endpoint {
    fn from_config(cfg: &EndpointConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            // Trailing slash would double up when the inbound path is appended.
            url: cfg.url.trim_end_matches('/').to_string(),
            priority: cfg.priority,
            group: cfg.group.clone(),
            group_priority: cfg.group_priority,
            timeout: cfg.timeout(),
            token: cfg.token.clone(),
            api_key: cfg.api_key.clone(),
            headers: cfg.headers.clone(),
        }
    }
}

/// Mutable health state for one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub healthy: bool,
    pub never_checked: bool,
    pub last_check: Option<Instant>,
    pub response_time: Option<Duration>,
    pub consecutive_failures: u32,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            healthy: false,
            never_checked: true,
            last_check: None,
            response_time: None,
            consecutive_failures: 0,
        }
    }
}

/// Admin-facing snapshot of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub name: String,
    pub url: String,
    pub group: String,
    pub group_priority: u32,
    pub priority: u32,
    pub healthy: bool,
    pub never_checked: bool,
    pub response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_check_secs_ago: Option<u64>,
}

/// Owns endpoint definitions and their health state, and produces the
/// ordered candidate lists handlers iterate over.
///
/// Definitions are RCU-swapped (`ArcSwap`) so priority updates are atomic and
/// readers always see an internally consistent list. Health transitions are
/// funneled through one ingestion point serialized by `transition_mu`; the
/// recovery notification is published inside that critical section so
/// subscribers never observe a notification that precedes its state write.
pub struct EndpointRegistry {
    endpoints: ArcSwap<Vec<Arc<Endpoint>>>,
    health: DashMap<String, EndpointHealth>,
    transition_mu: Mutex<()>,
    recovery_subs: Mutex<RecoverySubs>,
    allow_unchecked: bool,
    selection: SelectionConfig,
    probe_client: reqwest::Client,
}

struct RecoverySubs {
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    next_id: u64,
}

impl EndpointRegistry {
    pub fn new(
        configs: &[EndpointConfig],
        health_cfg: &HealthCheckConfig,
        selection: SelectionConfig,
        probe_client: reqwest::Client,
    ) -> Self {
        let endpoints: Vec<Arc<Endpoint>> = configs
            .iter()
            .map(|cfg| Arc::new(Endpoint::from_config(cfg)))
            .collect();

        let health = DashMap::new();
        for ep in &endpoints {
            health.insert(ep.name.clone(), EndpointHealth::default());
        }

        Self {
            endpoints: ArcSwap::new(Arc::new(endpoints)),
            health,
            transition_mu: Mutex::new(()),
            recovery_subs: Mutex::new(RecoverySubs {
                subscribers: HashMap::new(),
                next_id: 0,
            }),
            allow_unchecked: health_cfg.allow_unchecked,
            selection,
            probe_client,
        }
    }

    // ---- Lookup ----

    pub fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.load().iter().find(|ep| ep.name == name).cloned()
    }

    /// Every configured endpoint regardless of health or group state.
    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.load().to_vec()
    }

    /// Every endpoint in an active group regardless of health — the relaxed
    /// set used by the no-healthy-endpoints fallback.
    pub fn all_in_active_groups(&self, groups: &GroupManager) -> Vec<Arc<Endpoint>> {
        let mut list: Vec<Arc<Endpoint>> = self
            .endpoints
            .load()
            .iter()
            .filter(|ep| groups.is_active(&ep.group))
            .cloned()
            .collect();
        sort_by_priority(&mut list);
        list
    }

    /// Healthy (or never-checked, in permissive mode) endpoints in active
    /// groups, ordered by group priority then endpoint priority. In fastest
    /// mode a live latency probe reorders the list; on probe deadline expiry
    /// the priority ordering is kept.
    pub async fn candidates(&self, groups: &GroupManager) -> Vec<Arc<Endpoint>> {
        let mut list: Vec<Arc<Endpoint>> = self
            .endpoints
            .load()
            .iter()
            .filter(|ep| groups.is_active(&ep.group) && self.is_eligible(&ep.name))
            .cloned()
            .collect();
        sort_by_priority(&mut list);

        if self.selection.is_fastest() && list.len() > 1 {
            list = self.probe_order(list).await;
        }

        list
    }

    fn is_eligible(&self, name: &str) -> bool {
        match self.health.get(name) {
            Some(h) => h.healthy || (h.never_checked && self.allow_unchecked),
            None => false,
        }
    }

    /// Whether a group currently has at least one usable endpoint.
    pub fn group_has_healthy(&self, group: &str) -> bool {
        self.endpoints
            .load()
            .iter()
            .any(|ep| ep.group == group && self.is_eligible(&ep.name))
    }

    // ---- Health transitions ----

    /// Record a passing probe. The first completed probe clears the
    /// never-checked flag; an unhealthy→healthy transition publishes a
    /// recovery notification.
    pub fn mark_healthy(&self, name: &str, response_time: Duration) {
        let _guard = self.lock_transitions();
        let Some(mut entry) = self.health.get_mut(name) else {
            return;
        };
        let recovered = !entry.healthy && !entry.never_checked;
        entry.healthy = true;
        entry.never_checked = false;
        entry.last_check = Some(Instant::now());
        entry.response_time = Some(response_time);
        entry.consecutive_failures = 0;
        drop(entry);

        metrics::gauge!("relay_endpoint_health_status", "endpoint" => name.to_string()).set(1.0);

        if recovered {
            info!("health: endpoint recovered, endpoint={}", name);
            self.publish_recovery(name);
        }
    }

    /// Record a failing probe.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        let _guard = self.lock_transitions();
        let Some(mut entry) = self.health.get_mut(name) else {
            return;
        };
        let was_healthy = entry.healthy || entry.never_checked;
        entry.healthy = false;
        entry.never_checked = false;
        entry.last_check = Some(Instant::now());
        entry.consecutive_failures += 1;
        let failures = entry.consecutive_failures;
        drop(entry);

        metrics::gauge!("relay_endpoint_health_status", "endpoint" => name.to_string()).set(0.0);

        if was_healthy {
            warn!(
                "health: endpoint marked unhealthy, endpoint={}, consecutive_failures={}, reason={}",
                name, failures, reason
            );
        } else {
            debug!(
                "health: endpoint still unhealthy, endpoint={}, consecutive_failures={}, reason={}",
                name, failures, reason
            );
        }
    }

    pub fn health_of(&self, name: &str) -> Option<EndpointHealth> {
        self.health.get(name).map(|entry| entry.clone())
    }

    // ---- Priority update ----

    /// Atomically change an endpoint's priority. Subsequent candidate
    /// lookups observe the new ordering; in-flight lookups keep the snapshot
    /// they already loaded.
    pub fn update_priority(&self, name: &str, priority: u32) -> bool {
        let current = self.endpoints.load_full();
        let Some(pos) = current.iter().position(|ep| ep.name == name) else {
            return false;
        };

        let mut next: Vec<Arc<Endpoint>> = current.to_vec();
        let ep = next[pos].clone();
        next[pos] = Arc::new(Endpoint {
            name: ep.name.clone(),
            url: ep.url.clone(),
            priority,
            group: ep.group.clone(),
            group_priority: ep.group_priority,
            timeout: ep.timeout,
            token: ep.token.clone(),
            api_key: ep.api_key.clone(),
            headers: ep.headers.clone(),
        });
        self.endpoints.store(Arc::new(next));
        info!("registry: priority updated, endpoint={}, priority={}", name, priority);
        true
    }

    // ---- Recovery notifications ----

    pub fn subscribe_recovery(&self) -> (u64, mpsc::Receiver<String>) {
        let mut subs = self.lock_subs();
        let id = subs.next_id;
        subs.next_id += 1;
        let (tx, rx) = mpsc::channel(RECOVERY_CHANNEL_CAPACITY);
        subs.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe_recovery(&self, id: u64) {
        self.lock_subs().subscribers.remove(&id);
    }

    fn publish_recovery(&self, name: &str) {
        let mut subs = self.lock_subs();
        subs.subscribers.retain(|id, tx| match tx.try_send(name.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("health: slow recovery subscriber, dropped notification, id={}", id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    // ---- Admin snapshot ----

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let now = Instant::now();
        let mut snaps: Vec<EndpointSnapshot> = self
            .endpoints
            .load()
            .iter()
            .map(|ep| {
                let health = self
                    .health
                    .get(&ep.name)
                    .map(|entry| entry.clone())
                    .unwrap_or_default();
                EndpointSnapshot {
                    name: ep.name.clone(),
                    url: ep.url.clone(),
                    group: ep.group.clone(),
                    group_priority: ep.group_priority,
                    priority: ep.priority,
                    healthy: health.healthy,
                    never_checked: health.never_checked,
                    response_time_ms: health.response_time.map(|d| d.as_millis() as u64),
                    consecutive_failures: health.consecutive_failures,
                    last_check_secs_ago: health
                        .last_check
                        .map(|at| now.saturating_duration_since(at).as_secs()),
                }
            })
            .collect();
        snaps.sort_by(|a, b| {
            (a.group_priority, a.priority, a.name.as_str())
                .cmp(&(b.group_priority, b.priority, b.name.as_str()))
        });
        snaps
    }

    // ---- Fastest-mode probe ----

    /// Probe every candidate concurrently and reorder by observed response
    /// time. Probe failures sink below successes but keep their relative
    /// priority order; an expired overall deadline keeps priority order.
    async fn probe_order(&self, list: Vec<Arc<Endpoint>>) -> Vec<Arc<Endpoint>> {
        let deadline = self.selection.probe_deadline();
        let path = self.selection.probe_path.clone();

        let probes = list.iter().enumerate().map(|(idx, ep)| {
            let client = self.probe_client.clone();
            let url = format!("{}{}", ep.url, path);
            async move {
                let start = Instant::now();
                let latency = match client.get(&url).timeout(deadline).send().await {
                    Ok(resp) if resp.status().is_success() => Some(start.elapsed()),
                    _ => None,
                };
                (idx, latency)
            }
        });

        let results =
            match tokio::time::timeout(deadline, futures_util::future::join_all(probes)).await {
                Ok(results) => results,
                Err(_) => {
                    debug!("registry: fastest probe deadline expired, keeping priority order");
                    return list;
                }
            };

        let mut order: Vec<(usize, Option<Duration>)> = results;
        order.sort_by_key(|(idx, latency)| match latency {
            Some(d) => (0u8, *d, *idx),
            None => (1u8, Duration::ZERO, *idx),
        });

        for (idx, latency) in &order {
            if let Some(latency) = latency {
                // Keep the measured latency visible to the admin surface.
                if let Some(mut entry) = self.health.get_mut(&list[*idx].name) {
                    entry.response_time = Some(*latency);
                }
            }
        }

        order.into_iter().map(|(idx, _)| list[idx].clone()).collect()
    }

    // ---- Internals ----

    fn lock_transitions(&self) -> std::sync::MutexGuard<'_, ()> {
        self.transition_mu
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subs(&self) -> std::sync::MutexGuard<'_, RecoverySubs> {
        self.recovery_subs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sort_by_priority(list: &mut [Arc<Endpoint>]) {
    list.sort_by(|a, b| {
        (a.group_priority, a.priority, a.name.as_str())
            .cmp(&(b.group_priority, b.priority, b.name.as_str()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupSettings, RelayConfig};

    fn config(toml_str: &str) -> RelayConfig {
        toml::from_str(toml_str).unwrap()
    }

    fn registry_from(cfg: &RelayConfig) -> EndpointRegistry {
        EndpointRegistry::new(
            &cfg.endpoints,
            &cfg.health_check,
            cfg.selection.clone(),
            reqwest::Client::new(),
        )
    }

    fn two_group_config() -> RelayConfig {
        config(
            r#"
            [[endpoints]]
            name = "a"
            url = "http://a.example.com"
            group = "main"
            group_priority = 1
            priority = 2

            [[endpoints]]
            name = "b"
            url = "http://b.example.com"
            group = "main"
            group_priority = 1
            priority = 1

            [[endpoints]]
            name = "c"
            url = "http://c.example.com"
            group = "backup"
            group_priority = 2
        "#,
        )
    }

    fn groups_for(auto: bool) -> GroupManager {
        let settings = GroupSettings {
            auto_switch_between_groups: auto,
            cooldown: 600.0,
        };
        GroupManager::new(vec![("main".into(), 1), ("backup".into(), 2)], &settings)
    }

    #[tokio::test]
    async fn test_candidates_ordered_by_group_then_priority() {
        let cfg = two_group_config();
        let reg = registry_from(&cfg);
        let groups = groups_for(true);

        // Never-checked endpoints are eligible in permissive mode.
        let names: Vec<String> = reg
            .candidates(&groups)
            .await
            .iter()
            .map(|ep| ep.name.clone())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_candidates_exclude_unhealthy_and_inactive_groups() {
        let cfg = two_group_config();
        let reg = registry_from(&cfg);
        let groups = groups_for(false); // manual: only "main" active

        reg.mark_unhealthy("b", "probe failed");

        let names: Vec<String> = reg
            .candidates(&groups)
            .await
            .iter()
            .map(|ep| ep.name.clone())
            .collect();
        // "b" unhealthy, "c" in inactive group.
        assert_eq!(names, vec!["a"]);
    }

    #[tokio::test]
    async fn test_strict_mode_requires_passing_probe() {
        let mut cfg = two_group_config();
        cfg.health_check.allow_unchecked = false;
        let reg = registry_from(&cfg);
        let groups = groups_for(true);

        assert!(reg.candidates(&groups).await.is_empty());

        reg.mark_healthy("a", Duration::from_millis(10));
        let names: Vec<String> = reg
            .candidates(&groups)
            .await
            .iter()
            .map(|ep| ep.name.clone())
            .collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn test_all_returns_everything() {
        let cfg = two_group_config();
        let reg = registry_from(&cfg);
        reg.mark_unhealthy("a", "down");
        reg.mark_unhealthy("b", "down");
        assert_eq!(reg.all().len(), 3);
    }

    #[test]
    fn test_all_in_active_groups_ignores_health() {
        let cfg = two_group_config();
        let reg = registry_from(&cfg);
        let groups = groups_for(false);
        reg.mark_unhealthy("a", "down");
        reg.mark_unhealthy("b", "down");

        let names: Vec<String> = reg
            .all_in_active_groups(&groups)
            .iter()
            .map(|ep| ep.name.clone())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_first_probe_clears_never_checked() {
        let cfg = two_group_config();
        let reg = registry_from(&cfg);

        assert!(reg.health_of("a").unwrap().never_checked);
        reg.mark_healthy("a", Duration::from_millis(5));
        let h = reg.health_of("a").unwrap();
        assert!(!h.never_checked);
        assert!(h.healthy);
        assert_eq!(h.response_time, Some(Duration::from_millis(5)));

        reg.mark_unhealthy("b", "connect refused");
        let h = reg.health_of("b").unwrap();
        assert!(!h.never_checked);
        assert!(!h.healthy);
        assert_eq!(h.consecutive_failures, 1);
    }

    #[test]
    fn test_update_priority_reorders_lookups() {
        let cfg = two_group_config();
        let reg = registry_from(&cfg);

        assert!(reg.update_priority("a", 0));
        let all = reg.all();
        let a = all.iter().find(|ep| ep.name == "a").unwrap();
        assert_eq!(a.priority, 0);

        assert!(!reg.update_priority("missing", 1));
    }

    #[tokio::test]
    async fn test_recovery_notification_on_unhealthy_to_healthy() {
        let cfg = two_group_config();
        let reg = registry_from(&cfg);
        let (id, mut rx) = reg.subscribe_recovery();

        // never_checked → healthy is not a recovery.
        reg.mark_healthy("a", Duration::from_millis(5));
        assert!(rx.try_recv().is_err());

        reg.mark_unhealthy("a", "down");
        reg.mark_healthy("a", Duration::from_millis(5));
        assert_eq!(rx.recv().await.unwrap(), "a");

        reg.unsubscribe_recovery(id);
        reg.mark_unhealthy("a", "down");
        reg.mark_healthy("a", Duration::from_millis(5));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_group_has_healthy() {
        let mut cfg = two_group_config();
        cfg.health_check.allow_unchecked = false;
        let reg = registry_from(&cfg);

        assert!(!reg.group_has_healthy("backup"));
        reg.mark_healthy("c", Duration::from_millis(7));
        assert!(reg.group_has_healthy("backup"));
        assert!(!reg.group_has_healthy("missing"));
    }
}
