use crate::config::RelayConfig;
use crate::endpoint::EndpointRegistry;
use crate::group::GroupManager;
use crate::lifecycle::LifecycleRegistry;
use crate::metrics::Metrics;
use crate::proxy::policy::RetryPolicy;
use crate::proxy::Forwarder;
use crate::suspend::SuspensionManager;
use crate::transport::Transports;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared engine state, cheaply cloneable.
///
/// Constructed bottom-up — transports first, then the registries, then the
/// managers that reference them — so no component holds a back-pointer to
/// the engine. Handlers receive the lifecycle *into* each call; the server
/// owns the lifecycle factory (`lifecycles`).
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub transports: Transports,
    pub registry: Arc<EndpointRegistry>,
    pub groups: Arc<GroupManager>,
    pub policy: RetryPolicy,
    pub suspension: Arc<SuspensionManager>,
    pub forwarder: Arc<Forwarder>,
    pub lifecycles: Arc<LifecycleRegistry>,
    pub metrics: Metrics,
    /// Cancelled once at shutdown; every in-flight request holds a child.
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let metrics = Metrics::install();
        let transports = Transports::build(&config.transport, &config.health_check)?;

        let registry = Arc::new(EndpointRegistry::new(
            &config.endpoints,
            &config.health_check,
            config.selection.clone(),
            transports.probe().clone(),
        ));

        let groups = Arc::new(GroupManager::new(
            group_priorities(&config),
            &config.groups,
        ));

        let policy = RetryPolicy::new(config.retry.clone());

        let suspension = Arc::new(SuspensionManager::new(
            config.suspension.clone(),
            registry.clone(),
            groups.clone(),
        ));

        let forwarder = Arc::new(Forwarder::new(transports.clone(), &config.streaming));

        Ok(Self {
            config: Arc::new(config),
            transports,
            registry,
            groups,
            policy,
            suspension,
            forwarder,
            lifecycles: Arc::new(LifecycleRegistry::new()),
            metrics,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Each group's priority is the smallest `group_priority` among its
/// endpoints, keeping declaration order for ties.
fn group_priorities(config: &RelayConfig) -> Vec<(String, u32)> {
    let mut priorities: HashMap<&str, u32> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for ep in &config.endpoints {
        match priorities.get_mut(ep.group.as_str()) {
            Some(priority) => *priority = (*priority).min(ep.group_priority),
            None => {
                priorities.insert(&ep.group, ep.group_priority);
                order.push(&ep.group);
            }
        }
    }
    order
        .into_iter()
        .map(|name| (name.to_string(), priorities[name]))
        .collect()
}
