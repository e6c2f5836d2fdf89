//! External media pipelines: description, process handling and
//! supervision.

mod chain;
mod process;
mod supervisor;

pub use chain::{CameraSettings, MAX_STAGES, PipelineSpec, StageRole, StageSpec};
pub use process::{STDERR_TAIL_LINES, StageExit, StageProcess};
pub use supervisor::{ExitOutcome, MediaPipelineSupervisor, PipelineEvent, SupervisorOptions};
