//! The guest wire protocol: tagged JSON-lines messages.

use serde::{Deserialize, Serialize};

use crate::store::TaskFile;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The vsock port the in-guest agent supervisor listens on.
pub const GUEST_PORT: u32 = 5000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A message on the host↔guest wire. One JSON object per `\n`-terminated line.
///
/// Host → guest: `init`, `input`, `heartbeat`. Guest → host: `output`, `exit`,
/// `error`, `heartbeat`. Unknown tags are schema errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    /// One-shot initialization frame sent by the host right after the
    /// handshake. No reply is expected.
    Init {
        /// API key for the agent.
        api_key: String,
        /// The initial prompt.
        prompt: String,
        /// Files to materialize in the guest working directory.
        files: Option<Vec<TaskFile>>,
    },

    /// A line of agent output. The `data` field is opaque to the relay.
    Output {
        /// Opaque agent output.
        data: String,
    },

    /// Subscriber input forwarded into the agent's stdin.
    Input {
        /// The input text.
        data: String,
    },

    /// The agent finished; the relay shuts down after seeing this.
    Exit {
        /// Agent exit code.
        code: i32,
    },

    /// The guest supervisor hit a problem (e.g. the agent failed to start).
    Error {
        /// What went wrong inside the guest.
        message: String,
    },

    /// Keep-alive, either direction. Dropped on receipt.
    Heartbeat,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Encodes a message as exactly one newline-terminated JSON line.
pub fn encode_line(message: &RelayMessage) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one line into a message. Unknown variants and malformed JSON are
/// rejected.
pub fn decode_line(line: &str) -> serde_json::Result<RelayMessage> {
    serde_json::from_str(line)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
