//! Live, in-memory view of a camera agent fleet.
//!
//! Inbound fleet events are normalized, applied in arrival order by the
//! [`Synchronizer`] and published as immutable [`FleetSnapshot`]s. The
//! [`FleetRuntime`] runs the whole thing on one task behind a [`FleetHandle`].

pub mod cache;
pub mod dispatch;
pub mod model;
pub mod normalize;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod stats;
pub mod sync;
pub mod wire;

pub use cache::{DetectionCache, OrphanQuarantine};
pub use dispatch::{CommandDispatcher, CommandError, CommandSink, OutboundCommand};
pub use model::{
    AgentRecord, BoundingBox, DeployRejection, Detection, DetectionRecord, FleetSnapshot,
    LinkState, SlotView, StatsRecord,
};
pub use normalize::{normalize, FleetEvent, NormalizationError, RawEvent, FLEET_EVENT_KINDS};
pub use registry::{AgentMeta, AgentRegistry};
pub use router::{EventRouter, RouteOutcome, Subscription};
pub use runtime::{FleetHandle, FleetRuntime};
pub use sync::{ApplyOutcome, IgnoreReason, SyncConfig, Synchronizer};
pub use wire::{decode_frame, encode_frame, EventFrame, FrameError, DEFAULT_MAX_FRAME_BYTES};
