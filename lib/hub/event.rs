//! Event shapes published to subscribers.

use serde::{Deserialize, Serialize};

use crate::store::TaskStatus;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An event published to task subscribers (server → client on the WebSocket).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsEvent {
    /// One guest output frame.
    Output {
        /// Opaque agent output line.
        data: String,
        /// Milliseconds since the Unix epoch at publish time.
        timestamp_ms: i64,
    },

    /// The task's stored status changed.
    Status {
        /// The new status.
        status: TaskStatus,
        /// Exit code, present once the task terminated with one.
        exit_code: Option<i32>,
    },

    /// A boot-progress marker from the provisioning pipeline.
    Progress {
        /// Which step of the pipeline is running.
        stage: BootStage,
        /// Human-readable description of the stage.
        message: String,
    },

    /// A terminal error; the hub closes after publishing one.
    Error {
        /// What went wrong.
        message: String,
    },

    /// Reply to a subscriber `ping`.
    Pong,
}

/// A message received from a subscriber (client → server on the WebSocket).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsCommand {
    /// Input to forward into the guest agent.
    Input {
        /// The input text.
        data: String,
    },

    /// Liveness probe; answered with [`WsEvent::Pong`].
    Ping,
}

/// The steps of the VM boot pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootStage {
    /// Allocating resources and spawning the hypervisor.
    CreatingVm,
    /// Waiting for the hypervisor control socket to appear.
    WaitingForSocket,
    /// Driving the hypervisor configuration API.
    ConfiguringVm,
    /// Instance started; the guest kernel is booting.
    BootingVm,
    /// Connecting to the in-guest agent listener.
    ConnectingAgent,
    /// Init frame sent; the agent is starting up.
    InitializingClaude,
    /// The task is streaming.
    Ready,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BootStage {
    /// Human-readable message for UI display.
    pub fn message(&self) -> &'static str {
        match self {
            BootStage::CreatingVm => "Starting VM...",
            BootStage::WaitingForSocket => "Starting VM...",
            BootStage::ConfiguringVm => "Configuring VM...",
            BootStage::BootingVm => "Booting...",
            BootStage::ConnectingAgent => "Connecting...",
            BootStage::InitializingClaude => "Initializing Claude...",
            BootStage::Ready => "Ready",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = WsEvent::Output {
            data: "hello".to_string(),
            timestamp_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"output","data":"hello","timestamp_ms":1700000000000}"#
        );

        let event = WsEvent::Progress {
            stage: BootStage::WaitingForSocket,
            message: BootStage::WaitingForSocket.message().to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""stage":"waiting_for_socket""#));
    }

    #[test]
    fn test_command_parsing_rejects_unknown() {
        let cmd: WsCommand = serde_json::from_str(r#"{"type":"input","data":"ls"}"#).unwrap();
        assert_eq!(
            cmd,
            WsCommand::Input {
                data: "ls".to_string()
            }
        );

        assert!(serde_json::from_str::<WsCommand>(r#"{"type":"reboot"}"#).is_err());
    }
}
