//! Per-task fan-out and replay.
//!
//! Each task gets one [`TaskHub`]: a broadcast channel with a bounded replay
//! ring. The relay publishes guest output into it, the orchestrator publishes
//! status and boot-progress markers, and WebSocket subscribers drain it, with
//! late joiners receiving the buffered history first. Subscriber input flows
//! the other way, through a sender registered by the relay's writer loop.

mod event;
mod hub;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use event::*;
pub use hub::*;
