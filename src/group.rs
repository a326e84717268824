use crate::config::GroupSettings;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of each subscriber's notification channel. Broadcasts never
/// block: a full channel drops the notification and the subscriber sees a
/// coalesced view on its next receive.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Active,
    Inactive,
    CoolingDown,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Inactive => "inactive",
            GroupStatus::CoolingDown => "cooling_down",
        }
    }
}

#[derive(Debug)]
struct GroupEntry {
    priority: u32,
    status: GroupStatus,
    cooldown_until: Option<Instant>,
    force_activated_at: Option<Instant>,
}

/// Admin-facing snapshot of one group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub priority: u32,
    pub status: &'static str,
    pub cooldown_remaining_secs: Option<u64>,
    pub force_activated: bool,
}

struct Inner {
    groups: HashMap<String, GroupEntry>,
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    next_subscriber_id: u64,
}

/// Tracks which endpoint groups may serve traffic and publishes
/// activation-change notifications.
///
/// Two routing modes:
/// - automatic (`auto_switch_between_groups = true`): every group starts
///   Active; pausing or cool-down suppresses a group, and cool-down expiry
///   restores it to Active without operator input.
/// - manual: exactly one group is active by policy; `activate` pauses the
///   previously active group, and cool-down expiry leaves the group Inactive
///   until an operator brings it back.
pub struct GroupManager {
    auto_switch: bool,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl GroupManager {
    /// `groups` is (name, priority) in preference order; in manual mode the
    /// smallest-priority group starts active.
    pub fn new(groups: Vec<(String, u32)>, settings: &GroupSettings) -> Self {
        let auto_switch = settings.auto_switch_between_groups;

        let initial_active = if auto_switch {
            None
        } else {
            groups
                .iter()
                .min_by_key(|(_, priority)| *priority)
                .map(|(name, _)| name.clone())
        };

        let entries = groups
            .into_iter()
            .map(|(name, priority)| {
                let status = if auto_switch || initial_active.as_deref() == Some(name.as_str()) {
                    GroupStatus::Active
                } else {
                    GroupStatus::Inactive
                };
                (
                    name,
                    GroupEntry {
                        priority,
                        status,
                        cooldown_until: None,
                        force_activated_at: None,
                    },
                )
            })
            .collect();

        Self {
            auto_switch,
            cooldown: settings.cooldown_duration(),
            inner: Mutex::new(Inner {
                groups: entries,
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            }),
        }
    }

    pub fn is_manual_mode(&self) -> bool {
        !self.auto_switch
    }

    pub fn default_cooldown(&self) -> Duration {
        self.cooldown
    }

    // ---- State transitions ----

    /// Make a group active. In manual mode any other active group is paused.
    /// Cool-down is not bypassed: activating a cooling group is rejected.
    pub fn activate(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.groups.get_mut(name) else {
            warn!("group: activate ignored, unknown group={}", name);
            return false;
        };
        Self::expire_cooldown(entry, self.auto_switch);
        if entry.status == GroupStatus::CoolingDown {
            warn!("group: activate rejected, group={} is cooling down", name);
            return false;
        }
        entry.status = GroupStatus::Active;
        entry.force_activated_at = None;

        if !self.auto_switch {
            for (other, entry) in inner.groups.iter_mut() {
                if other != name && entry.status == GroupStatus::Active {
                    entry.status = GroupStatus::Inactive;
                    debug!("group: paused by activation, group={}", other);
                }
            }
        }

        info!("group: activated, group={}", name);
        metrics::counter!("relay_group_switch_total", "group" => name.to_string()).increment(1);
        Self::broadcast(&mut inner, name);
        true
    }

    /// Operator override: make a group active bypassing cool-down. The
    /// force-activation timestamp is recorded for the admin surface.
    pub fn force_activate(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.groups.get_mut(name) else {
            warn!("group: force-activate ignored, unknown group={}", name);
            return false;
        };
        entry.status = GroupStatus::Active;
        entry.cooldown_until = None;
        entry.force_activated_at = Some(Instant::now());

        if !self.auto_switch {
            for (other, entry) in inner.groups.iter_mut() {
                if other != name && entry.status == GroupStatus::Active {
                    entry.status = GroupStatus::Inactive;
                }
            }
        }

        info!("group: force-activated, group={}", name);
        metrics::counter!("relay_group_switch_total", "group" => name.to_string()).increment(1);
        Self::broadcast(&mut inner, name);
        true
    }

    pub fn pause(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.groups.get_mut(name) else {
            warn!("group: pause ignored, unknown group={}", name);
            return false;
        };
        if entry.status != GroupStatus::Active {
            return false;
        }
        entry.status = GroupStatus::Inactive;
        entry.force_activated_at = None;
        info!("group: paused, group={}", name);
        true
    }

    /// Bring a paused group back. Equivalent to `activate` for eligible
    /// groups; kept as a distinct operation for the operator surface.
    pub fn resume(&self, name: &str) -> bool {
        self.activate(name)
    }

    /// Suppress a group for `duration`. While cooling it is absent from
    /// every candidate lookup.
    pub fn cool_down(&self, name: &str, duration: Duration) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.groups.get_mut(name) else {
            warn!("group: cool-down ignored, unknown group={}", name);
            return false;
        };
        entry.status = GroupStatus::CoolingDown;
        entry.cooldown_until = Some(Instant::now() + duration);
        entry.force_activated_at = None;
        info!(
            "group: cooling down, group={}, duration={:.1}s",
            name,
            duration.as_secs_f64()
        );
        true
    }

    // ---- Queries ----

    /// Whether a group may serve traffic right now. Expired cool-downs are
    /// resolved lazily on read, so a group "reappears" without any external
    /// event once its timer elapses.
    pub fn is_active(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.groups.get_mut(name) else {
            return false;
        };
        Self::expire_cooldown(entry, self.auto_switch);
        entry.status == GroupStatus::Active
    }

    /// Names of all currently active groups.
    pub fn active_groups(&self) -> Vec<String> {
        let mut inner = self.lock();
        let auto = self.auto_switch;
        let mut names: Vec<String> = inner
            .groups
            .iter_mut()
            .filter_map(|(name, entry)| {
                Self::expire_cooldown(entry, auto);
                (entry.status == GroupStatus::Active).then(|| name.clone())
            })
            .collect();
        names.sort();
        names
    }

    /// Groups that are neither active nor cooling — the pool a suspended
    /// request could recover into after an operator switch.
    pub fn standby_groups(&self) -> Vec<String> {
        let mut inner = self.lock();
        let auto = self.auto_switch;
        let mut names: Vec<String> = inner
            .groups
            .iter_mut()
            .filter_map(|(name, entry)| {
                Self::expire_cooldown(entry, auto);
                (entry.status == GroupStatus::Inactive).then(|| name.clone())
            })
            .collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        let mut inner = self.lock();
        let auto = self.auto_switch;
        let mut snaps: Vec<GroupSnapshot> = inner
            .groups
            .iter_mut()
            .map(|(name, entry)| {
                Self::expire_cooldown(entry, auto);
                GroupSnapshot {
                    name: name.clone(),
                    priority: entry.priority,
                    status: entry.status.as_str(),
                    cooldown_remaining_secs: entry
                        .cooldown_until
                        .map(|until| until.saturating_duration_since(Instant::now()).as_secs()),
                    force_activated: entry.force_activated_at.is_some(),
                }
            })
            .collect();
        snaps.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        snaps
    }

    // ---- Change notifications ----

    /// Register for activation-change notifications. The returned receiver
    /// yields the newly-activated group name. Callers must pair this with
    /// `unsubscribe` on every exit path; the id keyed here is the handle.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let mut inner = self.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        inner.subscribers.insert(id, tx);
        debug!("group: subscriber added, id={}", id);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.lock();
        if inner.subscribers.remove(&id).is_some() {
            debug!("group: subscriber removed, id={}", id);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn broadcast(inner: &mut Inner, activated: &str) {
        inner.subscribers.retain(|id, tx| {
            match tx.try_send(activated.to_string()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("group: slow subscriber, dropped notification, id={}", id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    // ---- Internals ----

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic while holding it; group state is
        // plain data, so continuing with the last-written state is sound.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expire_cooldown(entry: &mut GroupEntry, auto_switch: bool) {
        if entry.status != GroupStatus::CoolingDown {
            return;
        }
        let Some(until) = entry.cooldown_until else {
            entry.status = GroupStatus::Inactive;
            return;
        };
        if Instant::now() >= until {
            entry.cooldown_until = None;
            // Automatic mode's resting state is Active; manual mode waits
            // for an operator.
            entry.status = if auto_switch {
                GroupStatus::Active
            } else {
                GroupStatus::Inactive
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(auto: bool) -> GroupSettings {
        GroupSettings {
            auto_switch_between_groups: auto,
            cooldown: 600.0,
        }
    }

    fn two_groups(auto: bool) -> GroupManager {
        GroupManager::new(
            vec![("main".to_string(), 1), ("backup".to_string(), 2)],
            &settings(auto),
        )
    }

    #[test]
    fn test_auto_mode_starts_all_active() {
        let gm = two_groups(true);
        assert_eq!(gm.active_groups(), vec!["backup", "main"]);
    }

    #[test]
    fn test_manual_mode_starts_highest_priority_active() {
        let gm = two_groups(false);
        assert_eq!(gm.active_groups(), vec!["main"]);
        assert_eq!(gm.standby_groups(), vec!["backup"]);
    }

    #[test]
    fn test_manual_activation_pauses_previous() {
        let gm = two_groups(false);
        assert!(gm.activate("backup"));
        assert_eq!(gm.active_groups(), vec!["backup"]);
        assert!(!gm.is_active("main"));
    }

    #[test]
    fn test_auto_activation_coexists() {
        let gm = two_groups(true);
        gm.pause("backup");
        assert_eq!(gm.active_groups(), vec!["main"]);
        assert!(gm.activate("backup"));
        assert_eq!(gm.active_groups(), vec!["backup", "main"]);
    }

    #[test]
    fn test_cooldown_excludes_until_elapsed_then_reappears() {
        let gm = two_groups(true);
        gm.cool_down("main", Duration::from_millis(30));
        assert!(!gm.is_active("main"));
        assert_eq!(gm.active_groups(), vec!["backup"]);

        std::thread::sleep(Duration::from_millis(50));
        // No external input — expiry is resolved on read.
        assert!(gm.is_active("main"));
        assert_eq!(gm.active_groups(), vec!["backup", "main"]);
    }

    #[test]
    fn test_manual_cooldown_expiry_returns_to_inactive() {
        let gm = two_groups(false);
        gm.cool_down("main", Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!gm.is_active("main"));
        assert!(gm.standby_groups().contains(&"main".to_string()));
    }

    #[test]
    fn test_activate_rejected_while_cooling() {
        let gm = two_groups(false);
        gm.cool_down("main", Duration::from_secs(600));
        assert!(!gm.activate("main"));
        assert!(!gm.is_active("main"));
    }

    #[test]
    fn test_force_activate_bypasses_cooldown() {
        let gm = two_groups(false);
        gm.cool_down("main", Duration::from_secs(600));
        assert!(gm.force_activate("main"));
        assert!(gm.is_active("main"));

        let snap = gm.snapshot();
        let main = snap.iter().find(|s| s.name == "main").unwrap();
        assert!(main.force_activated);
    }

    #[test]
    fn test_unknown_group_operations_are_rejected() {
        let gm = two_groups(true);
        assert!(!gm.activate("nope"));
        assert!(!gm.pause("nope"));
        assert!(!gm.cool_down("nope", Duration::from_secs(1)));
        assert!(!gm.is_active("nope"));
    }

    #[tokio::test]
    async fn test_subscribe_receives_activation() {
        let gm = two_groups(false);
        let (id, mut rx) = gm.subscribe();

        gm.activate("backup");
        assert_eq!(rx.recv().await.unwrap(), "backup");

        gm.unsubscribe(id);
        assert_eq!(gm.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_each_subscription_is_independent() {
        let gm = two_groups(false);
        let (id_a, mut rx_a) = gm.subscribe();
        let (_id_b, mut rx_b) = gm.subscribe();

        gm.activate("backup");
        assert_eq!(rx_a.recv().await.unwrap(), "backup");
        assert_eq!(rx_b.recv().await.unwrap(), "backup");

        gm.unsubscribe(id_a);
        gm.activate("main");
        assert_eq!(rx_b.recv().await.unwrap(), "main");
        assert_eq!(gm.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_not_blocks() {
        let gm = two_groups(true);
        let (_id, mut rx) = gm.subscribe();

        // Fill the channel past capacity; broadcasts must not block.
        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 3) {
            gm.activate("backup");
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= SUBSCRIBER_CHANNEL_CAPACITY);
        assert!(received > 0);
    }

    #[test]
    fn test_dropped_receiver_is_pruned_on_broadcast() {
        let gm = two_groups(true);
        let (_id, rx) = gm.subscribe();
        drop(rx);
        gm.activate("backup");
        assert_eq!(gm.subscriber_count(), 0);
    }
}
