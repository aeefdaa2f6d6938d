use crate::model::LinkState;
use crate::registry::AgentRegistry;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Command sent upstream to the fleet server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    DeployStart { agent_id: String },
    DeployStop { agent_id: String },
}

impl OutboundCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundCommand::DeployStart { .. } => "deploy_start",
            OutboundCommand::DeployStop { .. } => "deploy_stop",
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            OutboundCommand::DeployStart { agent_id } | OutboundCommand::DeployStop { agent_id } => {
                agent_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("fleet link is not connected")]
    NotConnected,
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("outbound command queue is full")]
    QueueFull,
    #[error("outbound command channel closed")]
    ChannelClosed,
    #[error("fleet synchronizer has been torn down")]
    TornDown,
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::NotConnected => "not_connected",
            CommandError::UnknownAgent(_) => "unknown_agent",
            CommandError::QueueFull => "queue_full",
            CommandError::ChannelClosed => "channel_closed",
            CommandError::TornDown => "torn_down",
        }
    }
}

/// Non-blocking hand-off of outbound commands to the transport.
pub trait CommandSink {
    fn try_send(&self, command: OutboundCommand) -> Result<(), CommandError>;
}

impl CommandSink for mpsc::Sender<OutboundCommand> {
    fn try_send(&self, command: OutboundCommand) -> Result<(), CommandError> {
        let kind = command.kind();
        match mpsc::Sender::try_send(self, command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    event = "command_queue_drop",
                    reason = "queue_full",
                    command = kind,
                    capacity = self.max_capacity()
                );
                Err(CommandError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(event = "command_queue_drop", reason = "channel_closed", command = kind);
                Err(CommandError::ChannelClosed)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckVerdict {
    Accepted,
    /// The ack answers a deploy superseded by a later stop.
    Stale,
    UnknownAgent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DeployFence {
    generation: u64,
    pending: Option<u64>,
}

/// Turns deploy and stop intents into outbound commands.
///
/// Each registered agent carries a generation that every stop advances. A
/// deploy is tagged with the generation current at send time, and an ack is
/// honored only while that tag is still current, so a stop cancels any deploy
/// still awaiting its ack. An agent that was never stopped accepts untagged
/// acks too, since deploys can be started by other viewers of the fleet.
#[derive(Debug, Default)]
pub struct CommandDispatcher {
    fences: HashMap<String, DeployFence>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, agent_id: &str) {
        self.fences.entry(agent_id.to_string()).or_default();
    }

    pub fn forget(&mut self, agent_id: &str) {
        self.fences.remove(agent_id);
    }

    /// Sends a deploy request. Leaves the registry untouched; the flag only
    /// flips once the fleet acknowledges.
    pub fn deploy(
        &mut self,
        link: LinkState,
        registry: &AgentRegistry,
        sink: &dyn CommandSink,
        agent_id: &str,
    ) -> Result<(), CommandError> {
        check_ready(link, registry, agent_id)?;
        sink.try_send(OutboundCommand::DeployStart {
            agent_id: agent_id.to_string(),
        })?;
        let fence = self.fences.entry(agent_id.to_string()).or_default();
        fence.pending = Some(fence.generation);
        debug!(event = "command_sent", command = "deploy_start", agent_id, generation = fence.generation);
        Ok(())
    }

    /// Sends a stop request and clears the deployed flag at once.
    /// Returns whether the flag changed.
    pub fn stop(
        &mut self,
        link: LinkState,
        registry: &mut AgentRegistry,
        sink: &dyn CommandSink,
        agent_id: &str,
    ) -> Result<bool, CommandError> {
        check_ready(link, registry, agent_id)?;
        sink.try_send(OutboundCommand::DeployStop {
            agent_id: agent_id.to_string(),
        })?;
        let fence = self.fences.entry(agent_id.to_string()).or_default();
        fence.generation = fence.generation.wrapping_add(1);
        fence.pending = None;
        debug!(event = "command_sent", command = "deploy_stop", agent_id, generation = fence.generation);
        Ok(registry.set_deployed(agent_id, false))
    }

    pub fn on_ack(&mut self, registry: &AgentRegistry, agent_id: &str) -> AckVerdict {
        if !registry.contains(agent_id) {
            return AckVerdict::UnknownAgent;
        }
        let fence = self.fences.entry(agent_id.to_string()).or_default();
        match fence.pending {
            Some(tag) if tag == fence.generation => {
                fence.pending = None;
                AckVerdict::Accepted
            }
            None if fence.generation == 0 => AckVerdict::Accepted,
            _ => AckVerdict::Stale,
        }
    }

    pub fn on_rejected(&mut self, agent_id: &str) {
        if let Some(fence) = self.fences.get_mut(agent_id) {
            fence.pending = None;
        }
    }

    /// A dropped link loses every in-flight deploy.
    pub fn clear_pending(&mut self) {
        for fence in self.fences.values_mut() {
            fence.pending = None;
        }
    }

    pub fn clear(&mut self) {
        self.fences.clear();
    }
}

fn check_ready(link: LinkState, registry: &AgentRegistry, agent_id: &str) -> Result<(), CommandError> {
    match link {
        LinkState::Connected => {}
        LinkState::TornDown => return Err(CommandError::TornDown),
        LinkState::Disconnected | LinkState::Connecting => return Err(CommandError::NotConnected),
    }
    if !registry.contains(agent_id) {
        return Err(CommandError::UnknownAgent(agent_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentMeta;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        sent: RefCell<Vec<OutboundCommand>>,
        fail_with: Option<CommandError>,
    }

    impl CommandSink for RecordingSink {
        fn try_send(&self, command: OutboundCommand) -> Result<(), CommandError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.sent.borrow_mut().push(command);
            Ok(())
        }
    }

    fn registry_with(ids: &[&str]) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for id in ids {
            registry.upsert_joined(
                id,
                AgentMeta {
                    display_name: id.to_string(),
                    operator_label: "ops".to_string(),
                },
            );
        }
        registry
    }

    #[test]
    fn commands_require_connected_link() {
        let mut dispatcher = CommandDispatcher::new();
        let mut registry = registry_with(&["a"]);
        let sink = RecordingSink::default();
        registry.set_deployed("a", true);

        assert_eq!(
            dispatcher.deploy(LinkState::Connecting, &registry, &sink, "a"),
            Err(CommandError::NotConnected)
        );
        assert_eq!(
            dispatcher.stop(LinkState::Disconnected, &mut registry, &sink, "a"),
            Err(CommandError::NotConnected)
        );
        assert_eq!(
            dispatcher.stop(LinkState::TornDown, &mut registry, &sink, "a"),
            Err(CommandError::TornDown)
        );
        assert!(sink.sent.borrow().is_empty());
        assert!(registry.is_deployed("a"), "no mutation without a live link");
    }

    #[test]
    fn deploy_waits_for_ack_and_stop_is_immediate() {
        let mut dispatcher = CommandDispatcher::new();
        let mut registry = registry_with(&["a"]);
        let sink = RecordingSink::default();

        dispatcher
            .deploy(LinkState::Connected, &registry, &sink, "a")
            .expect("deploy");
        assert!(!registry.is_deployed("a"));
        assert_eq!(dispatcher.on_ack(&registry, "a"), AckVerdict::Accepted);
        registry.set_deployed("a", true);

        let changed = dispatcher
            .stop(LinkState::Connected, &mut registry, &sink, "a")
            .expect("stop");
        assert!(changed);
        assert!(!registry.is_deployed("a"));
        assert_eq!(
            *sink.sent.borrow(),
            vec![
                OutboundCommand::DeployStart {
                    agent_id: "a".to_string()
                },
                OutboundCommand::DeployStop {
                    agent_id: "a".to_string()
                },
            ]
        );
    }

    #[test]
    fn stop_fences_off_in_flight_deploy_ack() {
        let mut dispatcher = CommandDispatcher::new();
        let mut registry = registry_with(&["a"]);
        let sink = RecordingSink::default();
        dispatcher.track("a");

        dispatcher
            .deploy(LinkState::Connected, &registry, &sink, "a")
            .expect("deploy");
        dispatcher
            .stop(LinkState::Connected, &mut registry, &sink, "a")
            .expect("stop");
        assert_eq!(dispatcher.on_ack(&registry, "a"), AckVerdict::Stale);

        dispatcher
            .deploy(LinkState::Connected, &registry, &sink, "a")
            .expect("redeploy");
        assert_eq!(dispatcher.on_ack(&registry, "a"), AckVerdict::Accepted);
        assert_eq!(dispatcher.on_ack(&registry, "a"), AckVerdict::Stale);
    }

    #[test]
    fn unsolicited_ack_accepted_until_first_stop() {
        let mut dispatcher = CommandDispatcher::new();
        let registry = registry_with(&["a"]);
        dispatcher.track("a");
        assert_eq!(dispatcher.on_ack(&registry, "a"), AckVerdict::Accepted);
        assert_eq!(dispatcher.on_ack(&registry, "ghost"), AckVerdict::UnknownAgent);
    }

    #[test]
    fn failed_send_leaves_state_untouched() {
        let mut dispatcher = CommandDispatcher::new();
        let mut registry = registry_with(&["a"]);
        registry.set_deployed("a", true);
        let sink = RecordingSink {
            fail_with: Some(CommandError::QueueFull),
            ..RecordingSink::default()
        };

        assert_eq!(
            dispatcher.stop(LinkState::Connected, &mut registry, &sink, "a"),
            Err(CommandError::QueueFull)
        );
        assert!(registry.is_deployed("a"));
        assert_eq!(
            dispatcher.deploy(LinkState::Connected, &registry, &sink, "missing"),
            Err(CommandError::UnknownAgent("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn channel_sink_reports_full_and_closed() {
        let (tx, mut rx) = mpsc::channel::<OutboundCommand>(1);
        let command = OutboundCommand::DeployStart {
            agent_id: "a".to_string(),
        };
        assert_eq!(CommandSink::try_send(&tx, command.clone()), Ok(()));
        assert_eq!(
            CommandSink::try_send(&tx, command.clone()),
            Err(CommandError::QueueFull)
        );
        assert_eq!(rx.recv().await, Some(command.clone()));
        drop(rx);
        assert_eq!(
            CommandSink::try_send(&tx, command),
            Err(CommandError::ChannelClosed)
        );
    }
}
