//! Durable task store.
//!
//! The store is the only durable state in the server: a SQLite database holding
//! one row per task plus an optional group association. It is the single writer
//! for task status; every transition is guarded in SQL so the state graph
//! cannot be violated by racing callers.

mod models;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use models::*;
pub use store::*;
