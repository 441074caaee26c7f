//! HTTP/WebSocket front.
//!
//! REST endpoints for task CRUD plus a WebSocket per task for live streaming.
//! Handlers validate, dispatch into the orchestrator, and shape responses;
//! they hold no state beyond the shared handles in [`AppState`].

mod handlers;
mod routes;
mod state;
mod types;
mod ws;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use handlers::*;
pub use routes::*;
pub use state::*;
pub use types::*;
pub use ws::*;
