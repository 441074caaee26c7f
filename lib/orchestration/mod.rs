//! Task lifecycle coordination.
//!
//! The orchestrator wires the store, the VM manager, the relay and the hub
//! registry together: it runs the detached boot pipeline behind `POST /tasks`,
//! reacts to relay outcomes, suspends idle tasks, tears everything down on
//! terminate, and reconciles leftover state at startup.

mod idle;
mod orchestrator;
mod reconcile;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use orchestrator::*;
