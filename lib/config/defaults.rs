//! Default values for the server configuration.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default address the HTTP server binds to.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// The default port the HTTP server listens on.
pub const DEFAULT_PORT: u16 = 8811;

/// The default base URL the browser front-end is served from.
pub const DEFAULT_WEB_URL: &str = "http://localhost:5173";

/// The default database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:///var/lib/lia/lia.db?mode=rwc";

/// The default maximum number of pooled database connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// The default path to the hypervisor binary.
pub const DEFAULT_HYPERVISOR_BIN: &str = "/usr/local/bin/firecracker";

/// The default path to the guest kernel image.
pub const DEFAULT_KERNEL_PATH: &str = "/var/lib/lia/kernel/vmlinux";

/// The default path to the rootfs template copied for each VM.
pub const DEFAULT_ROOTFS_PATH: &str = "/var/lib/lia/rootfs/rootfs.ext4";

/// The default directory holding per-task volumes.
pub const DEFAULT_VOLUMES_DIR: &str = "/var/lib/lia/volumes";

/// The default directory holding control and vsock sockets.
pub const DEFAULT_SOCKETS_DIR: &str = "/var/lib/lia/sockets";

/// The default directory holding hypervisor log files.
pub const DEFAULT_LOGS_DIR: &str = "/var/lib/lia/logs";

/// The default directory holding hypervisor pid files.
pub const DEFAULT_PIDS_DIR: &str = "/var/lib/lia/pids";

/// The default directory holding tap device name records.
pub const DEFAULT_TAPS_DIR: &str = "/var/lib/lia/taps";

/// The default machine type passed to the hypervisor.
pub const DEFAULT_MACHINE_TYPE: &str = "microvm";

/// The default number of vCPUs for a task VM.
pub const DEFAULT_VCPU_COUNT: u32 = 2;

/// The default memory size in MiB for a task VM.
pub const DEFAULT_MEMORY_MB: u32 = 2048;

/// The default data volume size in GiB for a task VM.
pub const DEFAULT_STORAGE_GB: u32 = 50;

/// The default idle window in minutes before a running task is suspended.
pub const DEFAULT_IDLE_TIMEOUT_MINUTES: f64 = 30.0;

/// The default first vsock context id handed out to guests.
pub const DEFAULT_VSOCK_CID_START: u32 = 100;

/// The default name of the host bridge task VMs attach to.
pub const DEFAULT_BRIDGE_NAME: &str = "lia-br0";

/// The default IP of the host bridge, used as the guest gateway.
pub const DEFAULT_BRIDGE_IP: &str = "172.16.0.1";

/// The default /24 subnet task VM addresses are drawn from.
pub const DEFAULT_SUBNET: &str = "172.16.0.0/24";
