pub mod link;
pub mod pipeline;

pub use link::LinkState;
pub use pipeline::PipelineState;
