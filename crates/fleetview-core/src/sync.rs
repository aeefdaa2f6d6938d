use crate::cache::{DetectionCache, OrphanQuarantine, QuarantineAdmission};
use crate::dispatch::{AckVerdict, CommandDispatcher, CommandError, CommandSink};
use crate::model::{DeployRejection, DetectionRecord, FleetSnapshot, LinkState};
use crate::normalize::{normalize, FleetEvent, NormalizationError, RawEvent, RosterEntry};
use crate::registry::{AgentMeta, AgentRegistry};
use crate::stats;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ORPHANS: usize = 256;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a detection may wait for its agent to join.
    pub grace_window: Duration,
    pub max_orphans: usize,
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            grace_window: DEFAULT_GRACE_WINDOW,
            max_orphans: DEFAULT_MAX_ORPHANS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn reap_interval(&self) -> Duration {
        std::cmp::max(Duration::from_millis(100), self.grace_window / 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotConnected,
    TornDown,
    StaleAck,
    UnknownAgent,
    /// Detection from a registered agent that is not deployed.
    NotDeployed,
    /// Orphan refused by a zero-capacity quarantine.
    QuarantineClosed,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::NotConnected => "not_connected",
            IgnoreReason::TornDown => "torn_down",
            IgnoreReason::StaleAck => "stale_ack",
            IgnoreReason::UnknownAgent => "unknown_agent",
            IgnoreReason::NotDeployed => "not_deployed",
            IgnoreReason::QuarantineClosed => "quarantine_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event was applied and the snapshot with this version published.
    Published(u64),
    Ignored(IgnoreReason),
}

impl ApplyOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, ApplyOutcome::Published(_))
    }
}

/// Owns fleet state and applies events and commands to it one at a time.
///
/// Every accepted change goes through a single mutation, one stats
/// recomputation and one publish. Callers only ever see the published
/// [`FleetSnapshot`], which is replaced rather than edited.
pub struct Synchronizer {
    config: SyncConfig,
    link: LinkState,
    registry: AgentRegistry,
    cache: DetectionCache,
    quarantine: OrphanQuarantine,
    dispatcher: CommandDispatcher,
    total_detections_seen: u64,
    last_rejection: Option<DeployRejection>,
    snapshot: Arc<FleetSnapshot>,
}

impl Synchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            quarantine: OrphanQuarantine::new(config.grace_window, config.max_orphans),
            config,
            link: LinkState::Disconnected,
            registry: AgentRegistry::new(),
            cache: DetectionCache::new(),
            dispatcher: CommandDispatcher::new(),
            total_detections_seen: 0,
            last_rejection: None,
            snapshot: Arc::new(FleetSnapshot::empty()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.snapshot.clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }

    pub fn orphans_pending(&self) -> usize {
        self.quarantine.len()
    }

    /// Moves the link state machine. Returns the published version, or `None`
    /// when the transition was a no-op or arrived after teardown.
    pub fn set_link(&mut self, next: LinkState) -> Option<u64> {
        if self.link == LinkState::TornDown || next == LinkState::TornDown || self.link == next {
            return None;
        }
        let previous = self.link;
        self.link = next;
        if next == LinkState::Disconnected {
            self.dispatcher.clear_pending();
        }
        info!(event = "link_state", from = %previous, to = %next);
        Some(self.publish())
    }

    pub fn apply_raw(&mut self, raw: &RawEvent) -> Result<ApplyOutcome, NormalizationError> {
        self.apply_raw_at(raw, Instant::now())
    }

    pub fn apply_raw_at(
        &mut self,
        raw: &RawEvent,
        now: Instant,
    ) -> Result<ApplyOutcome, NormalizationError> {
        match normalize(raw) {
            Ok(event) => Ok(self.apply_event_at(event, now)),
            Err(err) => {
                warn!(event = "event_rejected", kind = %raw.kind, code = err.code(), error = %err);
                Err(err)
            }
        }
    }

    pub fn apply_event(&mut self, event: FleetEvent) -> ApplyOutcome {
        self.apply_event_at(event, Instant::now())
    }

    pub fn apply_event_at(&mut self, event: FleetEvent, now: Instant) -> ApplyOutcome {
        match self.link {
            LinkState::Connected => {}
            LinkState::TornDown => return ApplyOutcome::Ignored(IgnoreReason::TornDown),
            LinkState::Disconnected | LinkState::Connecting => {
                debug!(event = "event_ignored", kind = event.kind(), reason = "not_connected");
                return ApplyOutcome::Ignored(IgnoreReason::NotConnected);
            }
        }

        let kind = event.kind();
        let applied = match event {
            FleetEvent::AgentJoined {
                agent_id,
                display_name,
                operator_label,
            } => {
                self.join(
                    &agent_id,
                    AgentMeta {
                        display_name,
                        operator_label,
                    },
                    now,
                );
                Ok(())
            }
            FleetEvent::AgentLeft { agent_id } => {
                self.leave(&agent_id);
                Ok(())
            }
            FleetEvent::DeployAck { agent_id } => self.ack(&agent_id),
            FleetEvent::DeployRejected { agent_id, reason } => {
                if let Some(agent_id) = agent_id.as_deref() {
                    self.dispatcher.on_rejected(agent_id);
                }
                info!(event = "deploy_rejected", agent_id = ?agent_id, reason = %reason);
                self.last_rejection = Some(DeployRejection { agent_id, reason });
                Ok(())
            }
            FleetEvent::DetectionReported(record) => self.report(record, now),
            FleetEvent::RosterSynced { agents } => {
                self.sync_roster(agents, now);
                Ok(())
            }
        };

        match applied {
            Ok(()) => ApplyOutcome::Published(self.publish()),
            Err(reason) => {
                debug!(event = "event_ignored", kind, reason = reason.as_str());
                ApplyOutcome::Ignored(reason)
            }
        }
    }

    pub fn deploy(&mut self, agent_id: &str, sink: &dyn CommandSink) -> Result<(), CommandError> {
        self.dispatcher
            .deploy(self.link, &self.registry, sink, agent_id)
    }

    /// Stops the agent locally and upstream. Publishes the resulting snapshot.
    pub fn stop(&mut self, agent_id: &str, sink: &dyn CommandSink) -> Result<u64, CommandError> {
        self.dispatcher
            .stop(self.link, &mut self.registry, sink, agent_id)?;
        self.cache.remove(agent_id);
        Ok(self.publish())
    }

    pub fn reap_orphans(&mut self) -> Vec<String> {
        self.reap_orphans_at(Instant::now())
    }

    /// Evicts orphans past the grace window. Publishes only if any were evicted.
    pub fn reap_orphans_at(&mut self, now: Instant) -> Vec<String> {
        if self.link == LinkState::TornDown {
            return Vec::new();
        }
        let expired = self.quarantine.reap(now);
        if expired.is_empty() {
            return expired;
        }
        for agent_id in &expired {
            info!(event = "orphan_evicted", agent_id = %agent_id, reason = "grace_window_elapsed");
        }
        self.publish();
        expired
    }

    /// Drops all held state and stops accepting input for good.
    pub fn teardown(&mut self) -> Option<u64> {
        if self.link == LinkState::TornDown {
            return None;
        }
        self.registry.clear();
        self.cache.clear();
        self.quarantine.clear();
        self.dispatcher.clear();
        self.last_rejection = None;
        self.link = LinkState::TornDown;
        info!(event = "synchronizer_teardown", total_detections_seen = self.total_detections_seen);
        Some(self.publish())
    }

    fn join(&mut self, agent_id: &str, meta: AgentMeta, now: Instant) {
        let created = self.registry.upsert_joined(agent_id, meta);
        self.dispatcher.track(agent_id);
        if created {
            debug!(event = "agent_joined", agent_id);
        }
        if let Some(record) = self.quarantine.release(agent_id, now) {
            debug!(event = "orphan_promoted", agent_id);
            self.cache.put(agent_id, record);
        }
    }

    fn leave(&mut self, agent_id: &str) {
        if self.registry.remove(agent_id).is_some() {
            debug!(event = "agent_left", agent_id);
        }
        self.cache.remove(agent_id);
        self.quarantine.discard(agent_id);
        self.dispatcher.forget(agent_id);
    }

    fn ack(&mut self, agent_id: &str) -> Result<(), IgnoreReason> {
        match self.dispatcher.on_ack(&self.registry, agent_id) {
            AckVerdict::Accepted => {
                self.registry.set_deployed(agent_id, true);
                Ok(())
            }
            AckVerdict::Stale => Err(IgnoreReason::StaleAck),
            AckVerdict::UnknownAgent => Err(IgnoreReason::UnknownAgent),
        }
    }

    fn report(&mut self, record: DetectionRecord, now: Instant) -> Result<(), IgnoreReason> {
        let agent_id = record.agent_id.clone();
        let count = record.detection_count;
        if self.registry.contains(&agent_id) {
            // A record promoted on join stays live until leave, stop or an undeployed roster entry.
            if !self.registry.is_deployed(&agent_id) && !self.cache.contains(&agent_id) {
                return Err(IgnoreReason::NotDeployed);
            }
            self.cache.put(&agent_id, record);
        } else {
            match self.quarantine.hold(record, now) {
                QuarantineAdmission::Refused => return Err(IgnoreReason::QuarantineClosed),
                QuarantineAdmission::HeldWithEviction(evicted) => {
                    warn!(event = "orphan_evicted", agent_id = %evicted, reason = "quarantine_full");
                }
                QuarantineAdmission::Held => {
                    debug!(event = "orphan_held", agent_id = %agent_id);
                }
                QuarantineAdmission::Replaced => {}
            }
        }
        self.total_detections_seen = self.total_detections_seen.saturating_add(count);
        Ok(())
    }

    fn sync_roster(&mut self, agents: Vec<RosterEntry>, now: Instant) {
        let listed: HashSet<&str> = agents.iter().map(|entry| entry.agent_id.as_str()).collect();
        let absent: Vec<String> = self
            .registry
            .ids()
            .filter(|agent_id| !listed.contains(agent_id))
            .map(str::to_string)
            .collect();
        for agent_id in &absent {
            self.leave(agent_id);
        }

        for entry in agents {
            self.join(
                &entry.agent_id,
                AgentMeta {
                    display_name: entry.display_name,
                    operator_label: entry.operator_label,
                },
                now,
            );
            self.registry.set_deployed(&entry.agent_id, entry.deployed);
            if !entry.deployed {
                self.cache.remove(&entry.agent_id);
            }
        }
        info!(event = "roster_synced", agents = self.registry.len(), removed = absent.len());
    }

    fn publish(&mut self) -> u64 {
        let version = self.snapshot.version + 1;
        self.snapshot = Arc::new(FleetSnapshot {
            version,
            link: self.link,
            agents: self.registry.list().to_vec(),
            detections: self.cache.shared(),
            stats: stats::compute(self.registry.list(), &self.cache, self.total_detections_seen),
            orphans_pending: self.quarantine.len(),
            last_rejection: self.last_rejection.clone(),
        });
        version
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OutboundCommand;
    use chrono::Utc;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        sent: RefCell<Vec<OutboundCommand>>,
    }

    impl CommandSink for RecordingSink {
        fn try_send(&self, command: OutboundCommand) -> Result<(), CommandError> {
            self.sent.borrow_mut().push(command);
            Ok(())
        }
    }

    fn connected() -> Synchronizer {
        let mut sync = Synchronizer::default();
        sync.set_link(LinkState::Connecting);
        sync.set_link(LinkState::Connected);
        sync
    }

    fn joined(id: &str) -> FleetEvent {
        FleetEvent::AgentJoined {
            agent_id: id.to_string(),
            display_name: format!("cam-{id}"),
            operator_label: "ops".to_string(),
        }
    }

    fn ack(id: &str) -> FleetEvent {
        FleetEvent::DeployAck {
            agent_id: id.to_string(),
        }
    }

    fn detection(id: &str, count: u64) -> FleetEvent {
        let now = Utc::now();
        FleetEvent::DetectionReported(DetectionRecord {
            agent_id: id.to_string(),
            camera_label: None,
            frame: Some("ZnJhbWU=".to_string()),
            detection_count: count,
            detections: Vec::new(),
            captured_at: now,
            received_at: now,
        })
    }

    fn assert_alerts_match_cache(sync: &Synchronizer) {
        let snapshot = sync.snapshot();
        let sum: u64 = snapshot
            .detections
            .values()
            .map(|record| record.detection_count)
            .sum();
        assert_eq!(snapshot.stats.active_alert_count, sum);
    }

    #[test]
    fn events_before_connect_are_ignored() {
        let mut sync = Synchronizer::default();
        assert_eq!(
            sync.apply_event(joined("a")),
            ApplyOutcome::Ignored(IgnoreReason::NotConnected)
        );
        assert_eq!(sync.version(), 0);
        assert!(sync.registry().is_empty());
    }

    #[test]
    fn each_accepted_event_publishes_once() {
        let mut sync = connected();
        let start = sync.version();
        assert_eq!(sync.apply_event(joined("a")), ApplyOutcome::Published(start + 1));
        assert_eq!(sync.apply_event(ack("a")), ApplyOutcome::Published(start + 2));
        assert_eq!(sync.apply_event(detection("a", 2)), ApplyOutcome::Published(start + 3));

        let snapshot = sync.snapshot();
        assert_eq!(snapshot.version, start + 3);
        assert_eq!(snapshot.stats.deployed_agents, 1);
        assert_eq!(snapshot.stats.active_alert_count, 2);
        assert_alerts_match_cache(&sync);
    }

    #[test]
    fn ack_after_leave_does_not_resurrect() {
        let mut sync = connected();
        sync.apply_event(joined("a"));
        sync.apply_event(FleetEvent::AgentLeft {
            agent_id: "a".to_string(),
        });
        assert_eq!(
            sync.apply_event(ack("a")),
            ApplyOutcome::Ignored(IgnoreReason::UnknownAgent)
        );
        assert!(sync.snapshot().agents.is_empty());
        assert_eq!(sync.snapshot().stats.deployed_agents, 0);
    }

    #[test]
    fn stop_cancels_pending_deploy() {
        let mut sync = connected();
        let sink = RecordingSink::default();
        sync.apply_event(joined("a"));
        sync.deploy("a", &sink).expect("deploy");
        sync.stop("a", &sink).expect("stop");

        assert_eq!(
            sync.apply_event(ack("a")),
            ApplyOutcome::Ignored(IgnoreReason::StaleAck)
        );
        assert!(!sync.snapshot().agent("a").expect("agent").deployed);
        assert_eq!(sink.sent.borrow().len(), 2);
    }

    #[test]
    fn detection_for_stopped_agent_is_dropped() {
        let mut sync = connected();
        let sink = RecordingSink::default();
        sync.apply_event(joined("a"));
        sync.apply_event(ack("a"));
        sync.apply_event(detection("a", 4));
        sync.stop("a", &sink).expect("stop");

        assert_eq!(
            sync.apply_event(detection("a", 9)),
            ApplyOutcome::Ignored(IgnoreReason::NotDeployed)
        );
        let snapshot = sync.snapshot();
        assert!(snapshot.detections.is_empty());
        assert_eq!(snapshot.stats.total_detections_seen, 4);
    }

    #[test]
    fn commands_fail_without_link() {
        let mut sync = Synchronizer::default();
        let sink = RecordingSink::default();
        assert_eq!(sync.deploy("a", &sink), Err(CommandError::NotConnected));
        assert_eq!(sync.stop("a", &sink), Err(CommandError::NotConnected));
        assert!(sink.sent.borrow().is_empty());
        assert_eq!(sync.version(), 0);
    }

    #[test]
    fn disconnect_keeps_state_and_drops_pending_deploys() {
        let mut sync = connected();
        let sink = RecordingSink::default();
        sync.apply_event(joined("a"));
        sync.apply_event(joined("b"));
        sync.apply_event(ack("a"));
        sync.stop("b", &sink).expect("stop");
        sync.deploy("b", &sink).expect("deploy");

        sync.set_link(LinkState::Disconnected);
        sync.set_link(LinkState::Connecting);
        sync.set_link(LinkState::Connected);
        assert_eq!(
            sync.apply_event(ack("b")),
            ApplyOutcome::Ignored(IgnoreReason::StaleAck)
        );

        let snapshot = sync.snapshot();
        assert_eq!(snapshot.link, LinkState::Connected);
        assert_eq!(snapshot.stats.total_agents, 2);
        assert!(snapshot.agent("a").expect("a").deployed);
    }

    #[test]
    fn orphan_is_quarantined_then_promoted_on_join() {
        let mut sync = connected();
        let start = Instant::now();
        sync.apply_event_at(detection("c", 3), start);

        let snapshot = sync.snapshot();
        assert!(snapshot.detections.is_empty());
        assert_eq!(snapshot.orphans_pending, 1);
        assert_eq!(snapshot.stats.active_alert_count, 0);
        assert_eq!(snapshot.stats.total_detections_seen, 3);

        sync.apply_event_at(joined("c"), start + Duration::from_secs(2));
        let snapshot = sync.snapshot();
        assert_eq!(snapshot.detection("c").expect("promoted").detection_count, 3);
        assert_eq!(snapshot.orphans_pending, 0);
        assert_eq!(snapshot.stats.active_alert_count, 3);
        assert_alerts_match_cache(&sync);
    }

    #[test]
    fn promoted_record_is_replaced_by_later_reports() {
        let mut sync = connected();
        let start = Instant::now();
        sync.apply_event_at(detection("c", 3), start);
        sync.apply_event_at(joined("c"), start + Duration::from_secs(1));

        assert!(sync
            .apply_event_at(detection("c", 0), start + Duration::from_secs(2))
            .is_published());
        let snapshot = sync.snapshot();
        assert!(!snapshot.agent("c").expect("c").deployed);
        assert_eq!(snapshot.detection("c").expect("cached").detection_count, 0);
        assert_eq!(snapshot.stats.active_alert_count, 0);
        assert_eq!(snapshot.stats.total_detections_seen, 3);
        assert_alerts_match_cache(&sync);
    }

    #[test]
    fn unchanged_records_are_shared_between_snapshots() {
        let mut sync = connected();
        sync.apply_event(joined("a"));
        sync.apply_event(ack("a"));
        sync.apply_event(detection("a", 2));
        let before = sync.snapshot();

        sync.apply_event(joined("b"));
        let after = sync.snapshot();
        assert!(Arc::ptr_eq(&before.detections["a"], &after.detections["a"]));
    }

    #[test]
    fn reaper_publishes_only_on_eviction() {
        let mut sync = connected();
        let start = Instant::now();
        sync.apply_event_at(detection("c", 3), start);
        let version = sync.version();

        assert!(sync.reap_orphans_at(start + Duration::from_secs(1)).is_empty());
        assert_eq!(sync.version(), version);

        let evicted = sync.reap_orphans_at(start + DEFAULT_GRACE_WINDOW + Duration::from_secs(1));
        assert_eq!(evicted, vec!["c".to_string()]);
        assert_eq!(sync.version(), version + 1);
        assert_eq!(sync.snapshot().orphans_pending, 0);

        sync.apply_event_at(joined("c"), start + Duration::from_secs(30));
        assert!(sync.snapshot().detections.is_empty());
    }

    #[test]
    fn roster_reconciles_membership_and_deploy_flags() {
        let mut sync = connected();
        sync.apply_event(joined("a"));
        sync.apply_event(joined("b"));
        sync.apply_event(ack("a"));
        sync.apply_event(detection("a", 2));

        let outcome = sync.apply_event(FleetEvent::RosterSynced {
            agents: vec![
                RosterEntry {
                    agent_id: "c".to_string(),
                    display_name: "cam-c".to_string(),
                    operator_label: "ops".to_string(),
                    deployed: true,
                },
                RosterEntry {
                    agent_id: "a".to_string(),
                    display_name: "cam-a".to_string(),
                    operator_label: "ops".to_string(),
                    deployed: false,
                },
            ],
        });
        assert!(outcome.is_published());

        let snapshot = sync.snapshot();
        let ids: Vec<_> = snapshot.agents.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(!snapshot.agent("a").expect("a").deployed);
        assert!(snapshot.agent("c").expect("c").deployed);
        assert!(snapshot.detections.is_empty());
        assert_eq!(snapshot.stats.deployed_agents, 1);
        assert_eq!(snapshot.stats.total_detections_seen, 2);
    }

    #[test]
    fn rejection_is_surfaced_without_flipping_deploy() {
        let mut sync = connected();
        let sink = RecordingSink::default();
        sync.apply_event(joined("a"));
        sync.deploy("a", &sink).expect("deploy");
        sync.apply_event(FleetEvent::DeployRejected {
            agent_id: Some("a".to_string()),
            reason: "Permission denied".to_string(),
        });

        let snapshot = sync.snapshot();
        assert!(!snapshot.agent("a").expect("a").deployed);
        assert_eq!(
            snapshot.last_rejection.as_ref().map(|r| r.reason.as_str()),
            Some("Permission denied")
        );
    }

    #[test]
    fn malformed_raw_event_leaves_synchronizer_usable() {
        let mut sync = connected();
        let version = sync.version();
        let bad = RawEvent::new("camera:connected", serde_json::json!({"username": "x"}));
        assert!(sync.apply_raw(&bad).is_err());
        assert_eq!(sync.version(), version);

        let good = RawEvent::new(
            "camera:connected",
            serde_json::json!({"sid": "a", "camera_id": "gate"}),
        );
        assert!(sync.apply_raw(&good).expect("apply").is_published());
    }

    #[test]
    fn teardown_is_terminal() {
        let mut sync = connected();
        let sink = RecordingSink::default();
        sync.apply_event(joined("a"));
        sync.apply_event(ack("a"));
        sync.apply_event(detection("a", 5));

        assert!(sync.teardown().is_some());
        let snapshot = sync.snapshot();
        assert_eq!(snapshot.link, LinkState::TornDown);
        assert!(snapshot.agents.is_empty());
        assert!(snapshot.detections.is_empty());
        assert_eq!(snapshot.stats.total_detections_seen, 5);

        assert!(sync.set_link(LinkState::Connected).is_none());
        assert_eq!(
            sync.apply_event(joined("b")),
            ApplyOutcome::Ignored(IgnoreReason::TornDown)
        );
        assert_eq!(sync.deploy("a", &sink), Err(CommandError::TornDown));
        assert!(sync.teardown().is_none());
    }
}
