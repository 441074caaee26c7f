//! Application configuration sections and the startup loader.

use serde::Deserialize;

use crate::LiaResult;

use super::defaults::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The immutable configuration handle for the whole server.
///
/// Built once at startup by [`AppConfig::load`] and passed by reference to
/// every component.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Hypervisor binary, images, and host file layout.
    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    /// Per-VM resource defaults and lifecycle knobs.
    #[serde(default)]
    pub vm: VmConfig,

    /// Host bridge and subnet settings.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Secrets held only in process memory.
    #[serde(default)]
    pub secrets: SecretsConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL of the browser front-end, used to compute task `web_url`s.
    #[serde(default = "default_web_url")]
    pub web_url: String,
}

/// Database settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Hypervisor binary, guest images, and the host file layout for per-task
/// artifacts.
#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorConfig {
    /// Path to the hypervisor binary.
    #[serde(default = "default_bin_path")]
    pub bin_path: String,

    /// Path to the guest kernel image.
    #[serde(default = "default_kernel_path")]
    pub kernel_path: String,

    /// Path to the rootfs template copied for each VM.
    #[serde(default = "default_rootfs_path")]
    pub rootfs_path: String,

    /// Directory holding per-task volumes.
    #[serde(default = "default_volumes_dir")]
    pub volumes_dir: String,

    /// Directory holding control and vsock sockets.
    #[serde(default = "default_sockets_dir")]
    pub sockets_dir: String,

    /// Directory holding hypervisor log files.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,

    /// Directory holding hypervisor pid files.
    #[serde(default = "default_pids_dir")]
    pub pids_dir: String,

    /// Directory holding tap device name records.
    #[serde(default = "default_taps_dir")]
    pub taps_dir: String,

    /// Machine type passed to the hypervisor.
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
}

/// Per-VM resource defaults and lifecycle knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// vCPUs given to a VM when the task config does not say otherwise.
    #[serde(default = "default_vcpu_count")]
    pub default_vcpu_count: u32,

    /// Memory in MiB given to a VM when the task config does not say otherwise.
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: u32,

    /// Data volume size in GiB when the task config does not say otherwise.
    #[serde(default = "default_storage_gb")]
    pub default_storage_gb: u32,

    /// Minutes of silence (no input, no non-heartbeat output) before a running
    /// task is suspended. Fractional values are honored.
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: f64,

    /// First vsock context id handed out to guests.
    #[serde(default = "default_vsock_cid_start")]
    pub vsock_cid_start: u32,
}

/// Host bridge and subnet settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Name of the bridge task VM taps attach to.
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,

    /// IP of the bridge, used as the guest gateway.
    #[serde(default = "default_bridge_ip")]
    pub bridge_ip: String,

    /// The /24 subnet guest addresses are drawn from.
    #[serde(default = "default_subnet")]
    pub subnet: String,
}

/// Secrets held only in process memory. Never logged: the `Debug`
/// implementation redacts every field.
#[derive(Clone, Default, Deserialize)]
pub struct SecretsConfig {
    /// API key handed to the in-guest agent through the init frame.
    #[serde(default)]
    pub agent_api_key: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AppConfig {
    /// Loads the configuration: `config/local` overlays `config/default`, and
    /// `LIA__`-prefixed environment variables (`__`-separated paths) overlay
    /// both.
    pub fn load() -> LiaResult<Self> {
        Self::load_from("config/default", "config/local")
    }

    /// Loads the configuration from explicit file stems. Both files are
    /// optional; missing sections fall back to compiled-in defaults.
    pub fn load_from(defaults: &str, local: &str) -> LiaResult<Self> {
        let config = ::config::Config::builder()
            .add_source(::config::File::with_name(defaults).required(false))
            .add_source(::config::File::with_name(local).required(false))
            .add_source(
                ::config::Environment::with_prefix("LIA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            web_url: default_web_url(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            bin_path: default_bin_path(),
            kernel_path: default_kernel_path(),
            rootfs_path: default_rootfs_path(),
            volumes_dir: default_volumes_dir(),
            sockets_dir: default_sockets_dir(),
            logs_dir: default_logs_dir(),
            pids_dir: default_pids_dir(),
            taps_dir: default_taps_dir(),
            machine_type: default_machine_type(),
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            default_vcpu_count: default_vcpu_count(),
            default_memory_mb: default_memory_mb(),
            default_storage_gb: default_storage_gb(),
            idle_timeout_minutes: default_idle_timeout_minutes(),
            vsock_cid_start: default_vsock_cid_start(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: default_bridge_name(),
            bridge_ip: default_bridge_ip(),
            subnet: default_subnet(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            hypervisor: HypervisorConfig::default(),
            vm: VmConfig::default(),
            network: NetworkConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("agent_api_key", &"<redacted>")
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Defaults
//--------------------------------------------------------------------------------------------------

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_web_url() -> String {
    DEFAULT_WEB_URL.to_string()
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_bin_path() -> String {
    DEFAULT_HYPERVISOR_BIN.to_string()
}

fn default_kernel_path() -> String {
    DEFAULT_KERNEL_PATH.to_string()
}

fn default_rootfs_path() -> String {
    DEFAULT_ROOTFS_PATH.to_string()
}

fn default_volumes_dir() -> String {
    DEFAULT_VOLUMES_DIR.to_string()
}

fn default_sockets_dir() -> String {
    DEFAULT_SOCKETS_DIR.to_string()
}

fn default_logs_dir() -> String {
    DEFAULT_LOGS_DIR.to_string()
}

fn default_pids_dir() -> String {
    DEFAULT_PIDS_DIR.to_string()
}

fn default_taps_dir() -> String {
    DEFAULT_TAPS_DIR.to_string()
}

fn default_machine_type() -> String {
    DEFAULT_MACHINE_TYPE.to_string()
}

fn default_vcpu_count() -> u32 {
    DEFAULT_VCPU_COUNT
}

fn default_memory_mb() -> u32 {
    DEFAULT_MEMORY_MB
}

fn default_storage_gb() -> u32 {
    DEFAULT_STORAGE_GB
}

fn default_idle_timeout_minutes() -> f64 {
    DEFAULT_IDLE_TIMEOUT_MINUTES
}

fn default_vsock_cid_start() -> u32 {
    DEFAULT_VSOCK_CID_START
}

fn default_bridge_name() -> String {
    DEFAULT_BRIDGE_NAME.to_string()
}

fn default_bridge_ip() -> String {
    DEFAULT_BRIDGE_IP.to_string()
}

fn default_subnet() -> String {
    DEFAULT_SUBNET.to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let config = AppConfig::default();

        assert_eq!(config.server.port, 8811);
        assert_eq!(config.vm.default_vcpu_count, 2);
        assert_eq!(config.vm.default_memory_mb, 2048);
        assert_eq!(config.vm.default_storage_gb, 50);
        assert_eq!(config.vm.vsock_cid_start, 100);
        assert_eq!(config.network.subnet, "172.16.0.0/24");
    }

    #[test]
    fn test_secrets_debug_is_redacted() {
        let secrets = SecretsConfig {
            agent_api_key: "sk-very-secret".to_string(),
        };

        let rendered = format!("{:?}", secrets);
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let config = AppConfig::load_from("/nonexistent/default", "/nonexistent/local").unwrap();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.database.max_connections, DEFAULT_MAX_CONNECTIONS);
    }
}
