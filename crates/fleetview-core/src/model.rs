use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One camera agent as the registry knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub display_name: String,
    pub operator_label: String,
    pub deployed: bool,
}

/// Pixel coordinates of a detection, top-left then bottom-right corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
}

/// Latest detection report of one agent. Replaced wholesale on every report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    pub detection_count: u64,
    pub detections: Vec<Detection>,
    pub captured_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsRecord {
    pub total_agents: usize,
    pub deployed_agents: usize,
    pub total_detections_seen: u64,
    pub active_alert_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    TornDown,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::TornDown => "torn_down",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fleet-side refusal of a deploy request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployRejection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub reason: String,
}

/// Read-only view of the fleet at one instant.
///
/// A snapshot is never edited after it is published; the synchronizer builds a
/// fresh one for every accepted change and hands it out behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub version: u64,
    pub link: LinkState,
    pub agents: Vec<AgentRecord>,
    pub detections: BTreeMap<String, Arc<DetectionRecord>>,
    pub stats: StatsRecord,
    pub orphans_pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rejection: Option<DeployRejection>,
}

impl FleetSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            link: LinkState::Disconnected,
            agents: Vec::new(),
            detections: BTreeMap::new(),
            stats: StatsRecord::default(),
            orphans_pending: 0,
            last_rejection: None,
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|agent| agent.agent_id == agent_id)
    }

    pub fn detection(&self, agent_id: &str) -> Option<&DetectionRecord> {
        self.detections.get(agent_id).map(Arc::as_ref)
    }

    /// Maps agents onto `count` fixed visual slots by list position.
    /// Slots past the agent count are `Waiting`; agents past `count` get no slot.
    pub fn slots(&self, count: usize) -> Vec<SlotView> {
        (0..count)
            .map(|index| match self.agents.get(index) {
                Some(agent) => SlotView::Occupied {
                    index,
                    agent: agent.clone(),
                    detection: self.detections.get(&agent.agent_id).cloned(),
                },
                None => SlotView::Waiting { index },
            })
            .collect()
    }
}

impl Default for FleetSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotView {
    Occupied {
        index: usize,
        agent: AgentRecord,
        #[serde(skip_serializing_if = "Option::is_none")]
        detection: Option<Arc<DetectionRecord>>,
    },
    Waiting {
        index: usize,
    },
}

impl SlotView {
    pub fn index(&self) -> usize {
        match self {
            SlotView::Occupied { index, .. } | SlotView::Waiting { index } => *index,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, SlotView::Waiting { .. })
    }
}
