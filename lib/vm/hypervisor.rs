//! HTTP client for the hypervisor control API, spoken over its Unix socket.

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, header::CONTENT_TYPE, Method, Request};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};

use crate::{LaunchStep, LiaError, LiaResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Client for one VM's control socket.
pub struct HypervisorClient {
    socket_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

#[derive(Debug, Serialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    vcpu_count: u32,
    mem_size_mib: u32,
}

#[derive(Debug, Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

#[derive(Debug, Serialize)]
struct VsockDevice {
    guest_cid: u32,
    uds_path: String,
}

#[derive(Debug, Serialize)]
struct InstanceActionInfo {
    action_type: &'static str,
}

#[derive(Debug, Serialize)]
struct VmStatePatch {
    state: &'static str,
}

/// Error body the hypervisor returns on failed calls.
#[derive(Debug, Deserialize)]
struct FaultResponse {
    fault_message: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorClient {
    /// Creates a client for the given control socket.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
        }
    }

    /// Configures the kernel image and boot arguments.
    pub async fn put_boot_source(&self, kernel_path: &str, boot_args: String) -> LiaResult<()> {
        self.send(
            Method::PUT,
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel_path.to_string(),
                boot_args,
            },
            LaunchStep::Configure,
        )
        .await
    }

    /// Configures vCPU count and memory size.
    pub async fn put_machine_config(&self, vcpu_count: u32, mem_size_mib: u32) -> LiaResult<()> {
        self.send(
            Method::PUT,
            "/machine-config",
            &MachineConfig {
                vcpu_count,
                mem_size_mib,
            },
            LaunchStep::Configure,
        )
        .await
    }

    /// Attaches a drive. `drive_id` doubles as the endpoint suffix.
    pub async fn put_drive(
        &self,
        drive_id: &str,
        path_on_host: &Path,
        is_root_device: bool,
    ) -> LiaResult<()> {
        self.send(
            Method::PUT,
            &format!("/drives/{}", drive_id),
            &Drive {
                drive_id: drive_id.to_string(),
                path_on_host: path_on_host.to_string_lossy().to_string(),
                is_root_device,
                is_read_only: false,
            },
            LaunchStep::Configure,
        )
        .await
    }

    /// Binds the guest NIC to a host tap device.
    pub async fn put_network_interface(&self, guest_mac: &str, tap_name: &str) -> LiaResult<()> {
        self.send(
            Method::PUT,
            "/network-interfaces/eth0",
            &NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: guest_mac.to_string(),
                host_dev_name: tap_name.to_string(),
            },
            LaunchStep::Configure,
        )
        .await
    }

    /// Configures the vsock device with the allocated context id.
    pub async fn put_vsock(&self, guest_cid: u32, uds_path: &Path) -> LiaResult<()> {
        self.send(
            Method::PUT,
            "/vsock",
            &VsockDevice {
                guest_cid,
                uds_path: uds_path.to_string_lossy().to_string(),
            },
            LaunchStep::Configure,
        )
        .await
    }

    /// Issues the instance-start action.
    pub async fn start_instance(&self) -> LiaResult<()> {
        self.send(
            Method::PUT,
            "/actions",
            &InstanceActionInfo {
                action_type: "InstanceStart",
            },
            LaunchStep::InstanceStart,
        )
        .await
    }

    /// Pauses the running VM.
    pub async fn pause(&self) -> LiaResult<()> {
        self.patch_vm_state("Paused").await
    }

    /// Resumes the paused VM.
    pub async fn resume(&self) -> LiaResult<()> {
        self.patch_vm_state("Resumed").await
    }

    async fn patch_vm_state(&self, state: &'static str) -> LiaResult<()> {
        self.request(Method::PATCH, "/vm", &VmStatePatch { state })
            .await
            .map_err(|message| {
                LiaError::Internal(anyhow::anyhow!(
                    "hypervisor refused vm state change to {}: {}",
                    state,
                    message
                ))
            })
    }

    async fn send<T: Serialize>(
        &self,
        method: Method,
        endpoint: &str,
        body: &T,
        step: LaunchStep,
    ) -> LiaResult<()> {
        self.request(method, endpoint, body)
            .await
            .map_err(|message| LiaError::vm_launch(step, message))
    }

    async fn request<T: Serialize>(
        &self,
        method: Method,
        endpoint: &str,
        body: &T,
    ) -> Result<(), String> {
        let payload =
            serde_json::to_vec(body).map_err(|e| format!("serialize {}: {}", endpoint, e))?;

        let uri: hyper::Uri = Uri::new(&self.socket_path, endpoint).into();
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| format!("build request for {}: {}", endpoint, e))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| format!("call {}: {}", endpoint, e))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("read response from {}: {}", endpoint, e))?
            .to_bytes();

        if !status.is_success() {
            let detail = serde_json::from_slice::<FaultResponse>(&bytes)
                .ok()
                .and_then(|fault| fault.fault_message)
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).to_string());
            return Err(format!("{} returned {}: {}", endpoint, status, detail));
        }

        Ok(())
    }
}
