//! The live handle to a provisioned VM and its host-side artifacts.

use std::{net::Ipv4Addr, path::PathBuf};

use getset::Getters;
use uuid::Uuid;

use crate::config::HypervisorConfig;

use super::network::tap_name_for;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything the manager needs to operate and eventually tear down one VM:
/// the hypervisor pid, the allocated network identity, and the paths of every
/// host-side artifact belonging to the task.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmHandle {
    /// The task this VM belongs to.
    task_id: Uuid,

    /// Stable VM identifier (`vm-<task id>`).
    vm_id: String,

    /// Hypervisor process id, when the spawn succeeded.
    pid: Option<u32>,

    /// The vsock context id assigned to the guest.
    cid: u32,

    /// The IP assigned to the guest.
    ip_address: Ipv4Addr,

    /// The guest's default gateway (the bridge IP).
    gateway: String,

    /// Name of the tap device plugged into the guest NIC.
    tap_name: String,

    /// The hypervisor control API socket.
    control_socket_path: PathBuf,

    /// The host side of the vsock multiplexer.
    vsock_path: PathBuf,

    /// Per-task copy of the rootfs template.
    rootfs_path: PathBuf,

    /// Sparse data volume.
    volume_path: PathBuf,

    /// Hypervisor log file. Must exist before launch.
    log_path: PathBuf,

    /// Hypervisor pid file.
    pid_path: PathBuf,

    /// Record of the tap device name, for cleanup after a restart.
    tap_record_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmHandle {
    /// Derives the full artifact layout for a task from the configured
    /// directories and the allocated resources.
    pub fn provision(
        task_id: Uuid,
        cid: u32,
        ip_address: Ipv4Addr,
        gateway: String,
        layout: &HypervisorConfig,
    ) -> Self {
        let sockets_dir = PathBuf::from(&layout.sockets_dir);
        let volumes_dir = PathBuf::from(&layout.volumes_dir);

        Self {
            task_id,
            vm_id: format!("vm-{}", task_id),
            pid: None,
            cid,
            ip_address,
            gateway,
            tap_name: tap_name_for(task_id),
            control_socket_path: sockets_dir.join(format!("{}.control", task_id)),
            vsock_path: sockets_dir.join(format!("{}.vsock", task_id)),
            rootfs_path: volumes_dir.join(format!("{}-rootfs.ext4", task_id)),
            volume_path: volumes_dir.join(format!("{}.ext4", task_id)),
            log_path: PathBuf::from(&layout.logs_dir).join(format!("{}.log", task_id)),
            pid_path: PathBuf::from(&layout.pids_dir).join(format!("{}.pid", task_id)),
            tap_record_path: PathBuf::from(&layout.taps_dir).join(task_id.to_string()),
        }
    }

    /// Records the hypervisor pid after a successful spawn.
    pub fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
