//! # tether-core
//!
//! Link, routing and media supervision for the tether operator console.
//!
//! This crate contains:
//! - **Codec**: `JsonLineCodec`, newline-delimited JSON frames over `tokio_util`
//! - **Network**: `LinkSession`, one TCP link with a background receive task
//! - **Input**: `ControllerSampler`, fixed-rate game controller sampling
//! - **Router**: `TopicRouter`, per-topic history, rates and subscriptions
//! - **Media**: `MediaPipelineSupervisor` for chains of external processes
//! - **Message**: the bus envelope and the known control commands
//! - **State**: lifecycle state machines for links and pipelines
//! - **Error**: `TetherError` and a stable `ErrorKind` for every failure

pub mod codec;
pub mod error;
pub mod input;
pub mod media;
pub mod message;
pub mod network;
pub mod router;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{Frame, JsonLineCodec, LineBuffer, MAX_FRAME_LENGTH};
pub use error::{
    DeviceError, EncodeError, EnvelopeError, ErrorKind, FrameError, LinkError, PipelineError,
    SamplerError, TetherError,
};
pub use input::{
    ButtonMap, ControllerSample, ControllerSampler, InputDevice, NeutralDevice, RawInputState,
    SampleSink, SamplerConfig,
};
pub use media::{
    CameraSettings, ExitOutcome, MediaPipelineSupervisor, PipelineEvent, PipelineSpec, StageRole,
    StageSpec, SupervisorOptions,
};
pub use message::{BusMessage, ControlCommand, Waypoint};
pub use network::{
    DisconnectReason, Endpoint, FrameHandler, LinkEvent, LinkEvents, LinkOptions, LinkSession,
    LinkStats, MIN_READ_TIMEOUT,
};
pub use router::{RouterConfig, SubscriptionId, TopicRouter, TopicSummary};
pub use state::{LinkState, PipelineState};
