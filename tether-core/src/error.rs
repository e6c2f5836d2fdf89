//! Domain-specific error types for the tether core.
//!
//! Every failure carries a stable [`ErrorKind`] plus a human-readable
//! detail (its `Display` string). No panics on bad input: malformed
//! frames, dead sockets and crashed processes all come back as typed,
//! recoverable errors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ── ErrorKind ────────────────────────────────────────────────────

/// Stable classification of every surfaced failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The TCP connect did not complete within its deadline.
    ConnectTimeout,
    /// The peer refused (or could not be reached for) the connection.
    ConnectRefused,
    /// A write or read failed on an established link.
    LinkBroken,
    /// One inbound line could not be decoded. Recoverable.
    ParseError,
    /// An outbound message could not be serialized. Caller bug.
    EncodeError,
    /// A required external program is absent or unresponsive.
    ProcessMissing,
    /// The terminal pipeline stage exited nonzero on its own.
    ProcessAbnormalExit,
    /// A process ignored its graceful stop and had to be killed.
    ProcessTerminationTimeout,
    /// The operation is not valid in the component's current state.
    InvalidState,
    /// The caller supplied malformed input (bad spec, bad envelope).
    InvalidInput,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectTimeout => "ConnectTimeout",
            Self::ConnectRefused => "ConnectRefused",
            Self::LinkBroken => "LinkBroken",
            Self::ParseError => "ParseError",
            Self::EncodeError => "EncodeError",
            Self::ProcessMissing => "ProcessMissing",
            Self::ProcessAbnormalExit => "ProcessAbnormalExit",
            Self::ProcessTerminationTimeout => "ProcessTerminationTimeout",
            Self::InvalidState => "InvalidState",
            Self::InvalidInput => "InvalidInput",
        };
        f.write_str(name)
    }
}

// ── Codec Errors ─────────────────────────────────────────────────

/// A single inbound line that failed to decode.
///
/// Produced per line; the stream keeps going after it.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("malformed frame ({reason}): {excerpt}")]
pub struct FrameError {
    /// Why the line was rejected.
    pub reason: String,
    /// The first bytes of the offending line, lossily decoded.
    pub excerpt: String,
}

impl FrameError {
    /// Longest excerpt kept from a bad line.
    pub const EXCERPT_LEN: usize = 120;

    pub fn new(reason: impl Into<String>, line: &[u8]) -> Self {
        let cut = line.len().min(Self::EXCERPT_LEN);
        Self {
            reason: reason.into(),
            excerpt: String::from_utf8_lossy(&line[..cut]).into_owned(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ParseError
    }
}

/// An outbound message could not be turned into a frame.
#[derive(Debug, Error)]
#[error("cannot encode message: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

impl EncodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::EncodeError
    }
}

// ── Link Errors ──────────────────────────────────────────────────

/// Failures of a [`LinkSession`](crate::network::LinkSession).
#[derive(Debug, Error)]
pub enum LinkError {
    /// The connect attempt exceeded its deadline.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// The connect attempt was rejected or the peer is unreachable.
    #[error("connect to {addr} failed: {source}")]
    ConnectRefused {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The established link can no longer carry data.
    #[error("link broken: {0}")]
    LinkBroken(String),

    /// The outbound message could not be serialized.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// A lifecycle transition that the state machine forbids.
    #[error("invalid link state: {0}")]
    InvalidState(&'static str),
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Self::ConnectRefused { .. } => ErrorKind::ConnectRefused,
            Self::LinkBroken(_) => ErrorKind::LinkBroken,
            Self::Encode(_) => ErrorKind::EncodeError,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

// ── Bus Errors ───────────────────────────────────────────────────

/// A decoded frame that is not a usable bus message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvelopeError {
    /// The frame is valid JSON but its shape is wrong.
    #[error("invalid bus envelope: {0}")]
    Shape(&'static str),

    /// A known control topic carried a payload it cannot accept.
    #[error("invalid payload for topic {topic}: {detail}")]
    Payload { topic: String, detail: String },
}

impl EnvelopeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}

// ── Input Errors ─────────────────────────────────────────────────

/// The input device could not be read this tick.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("input device read failed: {0}")]
    Read(String),
}

/// Why a [`ControllerSampler`](crate::input::ControllerSampler) stopped on its own.
#[derive(Debug, Error)]
pub enum SamplerError {
    /// The send path rejected a sample.
    #[error("sample send failed: {0}")]
    Send(#[from] LinkError),

    /// The sampler configuration is unusable.
    #[error("invalid sampler config: {0}")]
    InvalidConfig(&'static str),

    /// The sampling task panicked or was aborted.
    #[error("sampler task failed: {0}")]
    Task(String),
}

impl SamplerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Send(e) => e.kind(),
            Self::InvalidConfig(_) => ErrorKind::InvalidInput,
            Self::Task(_) => ErrorKind::InvalidState,
        }
    }
}

// ── Pipeline Errors ──────────────────────────────────────────────

/// Failures of the [`MediaPipelineSupervisor`](crate::media::MediaPipelineSupervisor).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required external program is absent or its probe failed.
    #[error("required program `{program}` unavailable: {detail}")]
    ProcessMissing { program: String, detail: String },

    /// A stage process could not be spawned.
    #[error("failed to spawn stage {stage} (`{program}`): {source}")]
    Spawn {
        stage: usize,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The terminal stage exited nonzero without a stop request.
    #[error("`{program}` exited abnormally ({status}); last output: {}", .stderr_tail.join(" | "))]
    AbnormalExit {
        program: String,
        status: String,
        stderr_tail: Vec<String>,
    },

    /// A process survived both the graceful stop and the kill.
    #[error("process {pid} did not terminate within {waited:?}")]
    TerminationTimeout { pid: u32, waited: Duration },

    /// The pipeline description is unusable.
    #[error("invalid pipeline spec: {0}")]
    InvalidSpec(&'static str),

    /// Start was requested while a pipeline is still active.
    #[error("invalid pipeline state: {0}")]
    InvalidState(&'static str),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProcessMissing { .. } | Self::Spawn { .. } => ErrorKind::ProcessMissing,
            Self::AbnormalExit { .. } => ErrorKind::ProcessAbnormalExit,
            Self::TerminationTimeout { .. } => ErrorKind::ProcessTerminationTimeout,
            Self::InvalidSpec(_) => ErrorKind::InvalidInput,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

// ── TetherError ──────────────────────────────────────────────────

/// The crate-wide error, for callers that juggle several components.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl TetherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(e) => e.kind(),
            Self::Encode(e) => e.kind(),
            Self::Link(e) => e.kind(),
            Self::Envelope(e) => e.kind(),
            Self::Sampler(e) => e.kind(),
            Self::Pipeline(e) => e.kind(),
        }
    }
}
