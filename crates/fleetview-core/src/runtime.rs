//! Drives a [`Synchronizer`] from a single tokio task.
//!
//! Link transitions, inbound events, user commands and teardown all arrive on
//! one bounded queue and are applied in arrival order. The orphan reaper runs
//! on the same task, so nothing ever touches fleet state concurrently.
//! Readers get snapshots through a `watch` channel.

use crate::dispatch::{CommandError, OutboundCommand};
use crate::model::{FleetSnapshot, LinkState};
use crate::normalize::{RawEvent, FLEET_EVENT_KINDS};
use crate::router::{EventRouter, Subscription};
use crate::sync::{SyncConfig, Synchronizer};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandIntent {
    Deploy(String),
    Stop(String),
}

/// Everything the runtime task consumes, in one queue.
pub enum FleetInput {
    Link {
        state: LinkState,
        reply: Option<oneshot::Sender<()>>,
    },
    Event(RawEvent),
    Command {
        intent: CommandIntent,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Teardown {
        reply: Option<oneshot::Sender<()>>,
    },
}

pub struct FleetRuntime {
    sync: Synchronizer,
    inputs: mpsc::Receiver<FleetInput>,
    loopback: mpsc::WeakSender<FleetInput>,
    router: EventRouter,
    outbound: mpsc::Sender<OutboundCommand>,
    snapshots: watch::Sender<Arc<FleetSnapshot>>,
    subscription: Option<Subscription>,
}

impl FleetRuntime {
    /// Spawns the runtime task. Outbound commands are handed to `outbound`;
    /// inbound events reach the task through `router` while the link is up.
    pub fn spawn(
        config: SyncConfig,
        router: EventRouter,
        outbound: mpsc::Sender<OutboundCommand>,
    ) -> (FleetHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let sync = Synchronizer::new(config);
        let (snapshots, snapshot_rx) = watch::channel(sync.snapshot());
        let runtime = FleetRuntime {
            sync,
            inputs: rx,
            loopback: tx.downgrade(),
            router,
            outbound,
            snapshots,
            subscription: None,
        };
        let task = tokio::spawn(runtime.run());
        (
            FleetHandle {
                inputs: tx,
                snapshots: snapshot_rx,
            },
            task,
        )
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.sync.config().reap_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            event = "runtime_start",
            grace_ms = self.sync.config().grace_window.as_millis() as u64,
            queue_capacity = self.sync.config().queue_capacity
        );

        loop {
            tokio::select! {
                input = self.inputs.recv() => {
                    let Some(input) = input else {
                        break;
                    };
                    self.handle(input);
                }
                _ = ticker.tick() => {
                    self.sync.reap_orphans_at(now());
                }
            }
            self.publish();
            if self.sync.link() == LinkState::TornDown {
                break;
            }
        }

        self.subscription = None;
        self.sync.teardown();
        self.publish();
        info!(event = "runtime_stop");
    }

    fn handle(&mut self, input: FleetInput) {
        match input {
            FleetInput::Link { state, reply } => {
                self.sync.set_link(state);
                self.track_subscription();
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            FleetInput::Event(raw) => {
                let _ = self.sync.apply_raw_at(&raw, now());
            }
            FleetInput::Command { intent, reply } => {
                let result = match &intent {
                    CommandIntent::Deploy(agent_id) => self.sync.deploy(agent_id, &self.outbound),
                    CommandIntent::Stop(agent_id) => {
                        self.sync.stop(agent_id, &self.outbound).map(|_| ())
                    }
                };
                if let Err(err) = &result {
                    debug!(event = "command_refused", command = ?intent, code = err.code());
                }
                self.publish();
                let _ = reply.send(result);
            }
            FleetInput::Teardown { reply } => {
                self.subscription = None;
                self.sync.teardown();
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    /// Holds the router subscription only while the link is connected.
    fn track_subscription(&mut self) {
        if self.sync.link() != LinkState::Connected {
            self.subscription = None;
            return;
        }
        if self.subscription.is_some() {
            return;
        }
        if let Some(sender) = self.loopback.upgrade() {
            self.subscription = Some(self.router.subscribe(&FLEET_EVENT_KINDS, sender));
        }
    }

    fn publish(&mut self) {
        if self.snapshots.borrow().version != self.sync.version() {
            self.snapshots.send_replace(self.sync.snapshot());
        }
    }
}

/// Reads the tokio clock so paused test time drives the grace window too.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Cloneable front door to a running [`FleetRuntime`].
#[derive(Clone)]
pub struct FleetHandle {
    inputs: mpsc::Sender<FleetInput>,
    snapshots: watch::Receiver<Arc<FleetSnapshot>>,
}

impl FleetHandle {
    pub async fn deploy(&self, agent_id: &str) -> Result<(), CommandError> {
        self.command(CommandIntent::Deploy(agent_id.to_string())).await
    }

    pub async fn stop(&self, agent_id: &str) -> Result<(), CommandError> {
        self.command(CommandIntent::Stop(agent_id.to_string())).await
    }

    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.snapshots.clone()
    }

    /// Reports a transport transition and waits until the runtime has applied it,
    /// so events read after a `Connected` are never routed before it.
    pub async fn link(&self, state: LinkState) -> Result<(), CommandError> {
        let (reply, done) = oneshot::channel();
        self.send(FleetInput::Link {
            state,
            reply: Some(reply),
        })
        .await?;
        done.await.map_err(|_| CommandError::TornDown)
    }

    /// Queues a raw event directly, bypassing the router.
    pub async fn submit(&self, raw: RawEvent) -> Result<(), CommandError> {
        self.send(FleetInput::Event(raw)).await
    }

    pub async fn teardown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .send(FleetInput::Teardown { reply: Some(reply) })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    async fn command(&self, intent: CommandIntent) -> Result<(), CommandError> {
        let (reply, result) = oneshot::channel();
        self.send(FleetInput::Command { intent, reply }).await?;
        result.await.map_err(|_| CommandError::TornDown)?
    }

    async fn send(&self, input: FleetInput) -> Result<(), CommandError> {
        self.inputs
            .send(input)
            .await
            .map_err(|_| CommandError::TornDown)
    }
}
