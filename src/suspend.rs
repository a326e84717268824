use crate::config::SuspensionConfig;
use crate::endpoint::EndpointRegistry;
use crate::group::GroupManager;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How a suspension wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// A group switch or endpoint recovery made candidates available again.
    Recovered,
    /// The suspension deadline expired.
    TimedOut,
    /// The inbound caller went away.
    Cancelled,
    /// Admission was denied (global cap reached) — reported without blocking.
    Rejected,
}

/// Parks exhausted requests until a group switch or endpoint recovery,
/// bounded by a global cap and a per-request deadline.
pub struct SuspensionManager {
    cfg: SuspensionConfig,
    registry: Arc<EndpointRegistry>,
    groups: Arc<GroupManager>,
    count: Arc<Mutex<usize>>,
}

/// RAII admission slot: decrements the global count on every exit path.
struct SuspendPermit {
    count: Arc<Mutex<usize>>,
}

impl Drop for SuspendPermit {
    fn drop(&mut self) {
        let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        *count = count.saturating_sub(1);
        metrics::gauge!("relay_suspended_requests").set(*count as f64);
    }
}

impl SuspensionManager {
    pub fn new(
        cfg: SuspensionConfig,
        registry: Arc<EndpointRegistry>,
        groups: Arc<GroupManager>,
    ) -> Self {
        Self {
            cfg,
            registry,
            groups,
            count: Arc::new(Mutex::new(0)),
        }
    }

    /// Whether suspending is worthwhile right now: suspension enabled, manual
    /// routing mode (automatic mode fails over by itself), at least one
    /// standby group holding a usable endpoint, and room under the cap.
    ///
    /// Advisory only — admission is re-checked atomically inside
    /// `wait_for_endpoint_recovery`.
    pub fn should_suspend(&self) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        if !self.groups.is_manual_mode() {
            return false;
        }
        if self.current_count() >= self.cfg.max_suspended_requests {
            return false;
        }
        self.groups
            .standby_groups()
            .iter()
            .any(|group| self.registry.group_has_healthy(group))
    }

    /// Park the request until a recovery signal, the deadline, or caller
    /// cancellation. Success fires on a group-change notification whose new
    /// group holds a usable endpoint, or on a recovery notification for
    /// `last_failed_endpoint` (any active-group endpoint when unspecified).
    ///
    /// The admission slot and both channel subscriptions are scoped to this
    /// call and released on every exit path.
    pub async fn wait_for_endpoint_recovery(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        last_failed_endpoint: Option<&str>,
    ) -> SuspendOutcome {
        let Some(_permit) = self.try_admit() else {
            debug!(
                "suspend: admission denied (cap {}), request_id={}",
                self.cfg.max_suspended_requests, request_id
            );
            return SuspendOutcome::Rejected;
        };

        let (group_sub, group_rx) = self.groups.subscribe();
        let (recovery_sub, recovery_rx) = self.registry.subscribe_recovery();

        info!(
            "suspend: request parked, request_id={}, last_failed_endpoint={}, timeout={:.0}s",
            request_id,
            last_failed_endpoint.unwrap_or("-"),
            self.cfg.timeout,
        );

        let outcome = self
            .wait_inner(cancel, group_rx, recovery_rx, last_failed_endpoint)
            .await;

        self.groups.unsubscribe(group_sub);
        self.registry.unsubscribe_recovery(recovery_sub);

        info!(
            "suspend: request released, request_id={}, outcome={:?}",
            request_id, outcome
        );
        outcome
    }

    async fn wait_inner(
        &self,
        cancel: &CancellationToken,
        group_rx: mpsc::Receiver<String>,
        recovery_rx: mpsc::Receiver<String>,
        last_failed_endpoint: Option<&str>,
    ) -> SuspendOutcome {
        let deadline = tokio::time::sleep(self.cfg.timeout_duration());
        tokio::pin!(deadline);

        // A closed channel is parked as None so the select does not spin on
        // it; only the deadline or cancellation can end the wait then.
        let mut group_rx = Some(group_rx);
        let mut recovery_rx = Some(recovery_rx);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SuspendOutcome::Cancelled,

                _ = &mut deadline => return SuspendOutcome::TimedOut,

                activated = recv_or_close(&mut group_rx), if group_rx.is_some() => {
                    let Some(group) = activated else {
                        continue;
                    };
                    if self.registry.group_has_healthy(&group) {
                        return SuspendOutcome::Recovered;
                    }
                    debug!("suspend: group activated without usable endpoints, group={}", group);
                }

                recovered = recv_or_close(&mut recovery_rx), if recovery_rx.is_some() => {
                    let Some(endpoint) = recovered else {
                        continue;
                    };
                    match last_failed_endpoint {
                        Some(wanted) if wanted == endpoint => return SuspendOutcome::Recovered,
                        Some(_) => {}
                        None => {
                            // Any recovery helps, provided its group serves traffic.
                            let in_active_group = self
                                .registry
                                .get(&endpoint)
                                .map(|ep| self.groups.is_active(&ep.group))
                                .unwrap_or(false);
                            if in_active_group {
                                return SuspendOutcome::Recovered;
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn current_count(&self) -> usize {
        *self.count.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn try_admit(&self) -> Option<SuspendPermit> {
        let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        if *count >= self.cfg.max_suspended_requests {
            return None;
        }
        *count += 1;
        metrics::gauge!("relay_suspended_requests").set(*count as f64);
        Some(SuspendPermit {
            count: self.count.clone(),
        })
    }
}

/// Receive from an optional channel, parking it permanently once the sender
/// side closes.
async fn recv_or_close(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    let Some(receiver) = rx.as_mut() else {
        return None;
    };
    match receiver.recv().await {
        Some(value) => Some(value),
        None => {
            *rx = None;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupSettings, HealthCheckConfig, RelayConfig, SelectionConfig};
    use std::time::Duration;

    fn build(
        enabled: bool,
        cap: usize,
        timeout: f64,
        manual: bool,
    ) -> (Arc<EndpointRegistry>, Arc<GroupManager>, SuspensionManager) {
        let cfg: RelayConfig = toml::from_str(
            r#"
            [[endpoints]]
            name = "a"
            url = "http://a.example.com"
            group = "main"
            group_priority = 1

            [[endpoints]]
            name = "b"
            url = "http://b.example.com"
            group = "backup"
            group_priority = 2
        "#,
        )
        .unwrap();

        let health_cfg = HealthCheckConfig {
            allow_unchecked: false,
            ..HealthCheckConfig::default()
        };
        let registry = Arc::new(EndpointRegistry::new(
            &cfg.endpoints,
            &health_cfg,
            SelectionConfig::default(),
            reqwest::Client::new(),
        ));
        let groups = Arc::new(GroupManager::new(
            vec![("main".into(), 1), ("backup".into(), 2)],
            &GroupSettings {
                auto_switch_between_groups: !manual,
                cooldown: 600.0,
            },
        ));
        let manager = SuspensionManager::new(
            SuspensionConfig {
                enabled,
                max_suspended_requests: cap,
                timeout,
            },
            registry.clone(),
            groups.clone(),
        );
        (registry, groups, manager)
    }

    #[test]
    fn test_should_suspend_requires_manual_mode_and_standby_health() {
        let (registry, _groups, manager) = build(true, 10, 300.0, true);
        // Standby group exists but has no healthy endpoint yet.
        assert!(!manager.should_suspend());

        registry.mark_healthy("b", Duration::from_millis(5));
        assert!(manager.should_suspend());
    }

    #[test]
    fn test_should_suspend_rejects_auto_mode_and_disabled() {
        let (registry, _groups, manager) = build(true, 10, 300.0, false);
        registry.mark_healthy("b", Duration::from_millis(5));
        assert!(!manager.should_suspend());

        let (registry, _groups, manager) = build(false, 10, 300.0, true);
        registry.mark_healthy("b", Duration::from_millis(5));
        assert!(!manager.should_suspend());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (_registry, _groups, manager) = build(true, 10, 0.05, true);
        let cancel = CancellationToken::new();
        let outcome = manager
            .wait_for_endpoint_recovery(&cancel, "req_1", None)
            .await;
        assert_eq!(outcome, SuspendOutcome::TimedOut);
        assert_eq!(manager.current_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let (_registry, _groups, manager) = build(true, 10, 30.0, true);
        let cancel = CancellationToken::new();
        let wait = manager.wait_for_endpoint_recovery(&cancel, "req_1", None);
        tokio::pin!(wait);

        tokio::select! {
            _ = &mut wait => panic!("wait ended before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        cancel.cancel();
        assert_eq!(wait.await, SuspendOutcome::Cancelled);
        assert_eq!(manager.current_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_recovers_on_group_switch_with_healthy_endpoint() {
        let (registry, groups, manager) = build(true, 10, 30.0, true);
        registry.mark_healthy("b", Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let manager = Arc::new(manager);
        let waiter = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .wait_for_endpoint_recovery(&cancel, "req_1", Some("a"))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.current_count(), 1);
        groups.activate("backup");

        assert_eq!(waiter.await.unwrap(), SuspendOutcome::Recovered);
        assert_eq!(manager.current_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_recovers_on_last_failed_endpoint() {
        let (registry, _groups, manager) = build(true, 10, 30.0, true);

        let cancel = CancellationToken::new();
        let manager = Arc::new(manager);
        let waiter = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .wait_for_endpoint_recovery(&cancel, "req_1", Some("a"))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        // Recovery of a different endpoint does not release the waiter.
        registry.mark_unhealthy("b", "down");
        registry.mark_healthy("b", Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.current_count(), 1);

        registry.mark_unhealthy("a", "down");
        registry.mark_healthy("a", Duration::from_millis(5));
        assert_eq!(waiter.await.unwrap(), SuspendOutcome::Recovered);
    }

    #[tokio::test]
    async fn test_cap_enforced_under_concurrent_admission() {
        let cap = 8;
        let (_registry, _groups, manager) = build(true, cap, 0.5, true);
        let manager = Arc::new(manager);

        let mut joins = Vec::new();
        for i in 0..50 {
            let manager = manager.clone();
            joins.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let id = format!("req_{}", i);
                manager.wait_for_endpoint_recovery(&cancel, &id, None).await
            }));
        }

        // While waiters are parked the live count must stay within the cap.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(manager.current_count() <= cap);
        }

        let mut rejected = 0;
        let mut timed_out = 0;
        for join in joins {
            match join.await.unwrap() {
                SuspendOutcome::Rejected => rejected += 1,
                SuspendOutcome::TimedOut => timed_out += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(rejected + timed_out, 50);
        assert_eq!(timed_out, cap);
        assert_eq!(manager.current_count(), 0);
    }
}
