//! Host↔guest data channel.
//!
//! The hypervisor exposes each guest's vsock as a host-side Unix stream behind
//! a text handshake (`CONNECT <port>\n` → `OK <host_port>\n`). Behind the
//! handshake, traffic is tagged JSON-lines messages: the relay sends one init
//! frame, then concurrently forwards guest output into the task's hub and
//! subscriber input back into the guest.

mod protocol;
mod relay;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use protocol::*;
pub use relay::*;
