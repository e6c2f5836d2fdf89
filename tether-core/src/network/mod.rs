mod session;

pub use session::{
    DisconnectReason, Endpoint, FrameHandler, LinkEvent, LinkEvents, LinkOptions, LinkSession,
    LinkStats, MIN_READ_TIMEOUT,
};
