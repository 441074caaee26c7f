//! Configuration types and loading for the VM-API server.
//!
//! Configuration is read once at startup: `config/local` overlays
//! `config/default`, and `LIA__`-prefixed environment variables overlay both.
//! The result is an immutable [`AppConfig`] handle shared by reference with
//! every component.

mod config;
mod defaults;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use config::*;
pub use defaults::*;
