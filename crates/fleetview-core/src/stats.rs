use crate::cache::DetectionCache;
use crate::model::{AgentRecord, StatsRecord};

/// Derives fleet counters from the current registry and cache.
///
/// Everything except `total_detections_seen` is recomputed from scratch on each
/// call, so the counts cannot drift from the state they describe. The lifetime
/// total is the one value carried forward by the caller.
pub fn compute(
    agents: &[AgentRecord],
    cache: &DetectionCache,
    total_detections_seen: u64,
) -> StatsRecord {
    StatsRecord {
        total_agents: agents.len(),
        deployed_agents: agents.iter().filter(|agent| agent.deployed).count(),
        total_detections_seen,
        active_alert_count: cache
            .records()
            .fold(0u64, |sum, record| sum.saturating_add(record.detection_count)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectionRecord;
    use chrono::Utc;

    fn agent(id: &str, deployed: bool) -> AgentRecord {
        AgentRecord {
            agent_id: id.to_string(),
            display_name: id.to_string(),
            operator_label: "ops".to_string(),
            deployed,
        }
    }

    fn detection(id: &str, count: u64) -> DetectionRecord {
        let now = Utc::now();
        DetectionRecord {
            agent_id: id.to_string(),
            camera_label: None,
            frame: None,
            detection_count: count,
            detections: Vec::new(),
            captured_at: now,
            received_at: now,
        }
    }

    #[test]
    fn counts_follow_current_state() {
        let agents = vec![agent("a", true), agent("b", false), agent("c", true)];
        let mut cache = DetectionCache::new();
        cache.put("a", detection("a", 2));
        cache.put("c", detection("c", 5));

        let stats = compute(&agents, &cache, 40);
        assert_eq!(stats.total_agents, 3);
        assert_eq!(stats.deployed_agents, 2);
        assert_eq!(stats.active_alert_count, 7);
        assert_eq!(stats.total_detections_seen, 40);

        cache.remove("c");
        assert_eq!(compute(&agents, &cache, 40).active_alert_count, 2);
    }

    #[test]
    fn empty_fleet_is_all_zero_except_lifetime_total() {
        let stats = compute(&[], &DetectionCache::new(), 9);
        assert_eq!(
            stats,
            StatsRecord {
                total_detections_seen: 9,
                ..StatsRecord::default()
            }
        );
    }

    #[test]
    fn alert_sum_saturates() {
        let mut cache = DetectionCache::new();
        cache.put("a", detection("a", u64::MAX));
        cache.put("b", detection("b", 1));
        assert_eq!(compute(&[], &cache, 0).active_alert_count, u64::MAX);
    }
}
