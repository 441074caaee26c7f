//! Tap device helpers and guest network identity.

use std::net::Ipv4Addr;

use tokio::process::Command;
use tracing::warn;
use uuid::Uuid;

use crate::{LaunchStep, LiaError, LiaResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Deterministic tap device name for a task: `tap-` plus the first eight hex
/// chars of the task id (interface names are limited to 15 bytes).
pub fn tap_name_for(task_id: Uuid) -> String {
    format!("tap-{}", &task_id.to_string()[..8])
}

/// Derives the guest MAC from the IP's last octet so packet captures stay
/// correlatable with task addresses.
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    format!("02:FC:00:00:00:{:02X}", ip.octets()[3])
}

/// Creates a tap device and attaches it to the bridge via the privileged
/// helper.
pub async fn create_tap(tap_name: &str, bridge_name: &str) -> LiaResult<()> {
    let output = Command::new("lia-create-tap")
        .arg(tap_name)
        .arg(bridge_name)
        .output()
        .await
        .map_err(|e| {
            LiaError::vm_launch(LaunchStep::Resources, format!("failed to run tap helper: {}", e))
        })?;

    if !output.status.success() {
        return Err(LiaError::vm_launch(
            LaunchStep::Resources,
            format!(
                "failed to create tap device {}: {}",
                tap_name,
                String::from_utf8_lossy(&output.stderr)
            ),
        ));
    }

    Ok(())
}

/// Deletes a tap device via the privileged helper. Failures are logged, not
/// propagated: teardown keeps going.
pub async fn delete_tap(tap_name: &str) {
    match Command::new("lia-delete-tap").arg(tap_name).output().await {
        Ok(output) if !output.status.success() => {
            warn!(
                tap_name,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "failed to delete tap device"
            );
        }
        Err(e) => warn!(tap_name, error = %e, "failed to run tap delete helper"),
        _ => {}
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_name_is_deterministic_and_short() {
        let task_id: Uuid = "0d9ed2a3-79f1-45a8-b8d4-3d29ad8e6a9f".parse().unwrap();
        let name = tap_name_for(task_id);
        assert_eq!(name, "tap-0d9ed2a3");
        assert_eq!(name, tap_name_for(task_id));
        assert!(name.len() <= 15);
    }

    #[test]
    fn test_mac_tracks_ip_last_octet() {
        assert_eq!(
            mac_for_ip("172.16.0.100".parse().unwrap()),
            "02:FC:00:00:00:64"
        );
        assert_eq!(
            mac_for_ip("172.16.0.254".parse().unwrap()),
            "02:FC:00:00:00:FE"
        );
    }
}
