//! The VM manager: hypervisor process lifecycle and host-side resources.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use ipnetwork::Ipv4Network;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    fs,
    process::{Child, Command},
    sync::{Mutex, RwLock},
    time,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    hub::BootStage,
    store::TaskConfig,
    LaunchStep, LiaError, LiaResult,
};

use super::{
    create_tap, delete_tap, mac_for_ip, HypervisorClient, ResourceAllocator, VmHandle,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long to poll for the control socket after spawning the hypervisor.
const SOCKET_WAIT_ATTEMPTS: u32 = 50;

/// Poll interval for the control socket.
const SOCKET_WAIT_DELAY: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL at terminate.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Callback for reporting boot progress while a VM is created.
pub type ProgressCallback = Box<dyn Fn(BootStage) + Send + Sync>;

/// Owns the hypervisor process lifecycle for every task.
///
/// Operations on the same task are serialized through a per-task mutex; across
/// tasks they run in parallel. The manager knows nothing about the task store
/// or the hub; callers record status changes.
pub struct VmManager {
    config: Arc<AppConfig>,
    allocator: ResourceAllocator,
    handles: RwLock<HashMap<Uuid, Arc<VmHandle>>>,
    children: Mutex<HashMap<Uuid, Child>>,
    task_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmManager {
    /// Creates a manager for the configured subnet and context-id range.
    pub fn new(config: Arc<AppConfig>) -> LiaResult<Self> {
        let network: Ipv4Network = config.network.subnet.parse().map_err(|e| {
            LiaError::Internal(anyhow::anyhow!(
                "invalid network.subnet {:?}: {}",
                config.network.subnet,
                e
            ))
        })?;

        Ok(Self {
            allocator: ResourceAllocator::new(config.vm.vsock_cid_start, network),
            config,
            handles: RwLock::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            task_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Reserves a context id ahead of [`VmManager::create`], so the caller can
    /// record it before the boot pipeline starts. The manager takes the id
    /// back (and frees it on failure) through `create`.
    pub fn reserve_cid(&self) -> u32 {
        self.allocator.allocate_cid()
    }

    /// Returns a reserved context id that never made it into a VM.
    pub fn release_cid(&self, cid: u32) {
        self.allocator.free_cid(cid);
    }

    /// Returns the live handle for a task, if one exists.
    pub async fn handle(&self, task_id: Uuid) -> Option<Arc<VmHandle>> {
        self.handles.read().await.get(&task_id).cloned()
    }

    /// Provisions and boots a VM for a task.
    ///
    /// Allocates the IP, prepares the host artifacts, spawns the hypervisor,
    /// drives its configuration API, and issues instance start. On failure at
    /// any step the process is killed, files are removed, and the IP and
    /// context id are freed before the error (naming the failing step)
    /// propagates.
    pub async fn create(
        &self,
        task_id: Uuid,
        cid: u32,
        task_config: &TaskConfig,
        ssh_public_key: Option<&str>,
        on_progress: &ProgressCallback,
    ) -> LiaResult<Arc<VmHandle>> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let ip_address = match self.allocator.allocate_ip() {
            Ok(ip) => ip,
            Err(e) => {
                self.allocator.free_cid(cid);
                return Err(e);
            }
        };

        let mut handle = VmHandle::provision(
            task_id,
            cid,
            ip_address,
            self.config.network.bridge_ip.clone(),
            &self.config.hypervisor,
        );

        match self
            .launch(&mut handle, task_config, ssh_public_key, on_progress)
            .await
        {
            Ok(child) => {
                info!(
                    task_id = %task_id,
                    ip = %ip_address,
                    cid,
                    pid = ?handle.get_pid(),
                    "vm started"
                );
                let handle = Arc::new(handle);
                self.handles.write().await.insert(task_id, handle.clone());
                self.children.lock().await.insert(task_id, child);
                Ok(handle)
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "vm launch failed, rolling back");
                self.remove_artifacts(&handle).await;
                self.free_resources(&handle);
                Err(e)
            }
        }
    }

    /// Pauses the task's VM through the control API. Recording the status
    /// change is the caller's job.
    pub async fn pause(&self, task_id: Uuid) -> LiaResult<()> {
        let handle = self.require_handle(task_id).await?;
        HypervisorClient::new(handle.get_control_socket_path())
            .pause()
            .await
    }

    /// Resumes the task's paused VM through the control API.
    pub async fn resume(&self, task_id: Uuid) -> LiaResult<()> {
        let handle = self.require_handle(task_id).await?;
        HypervisorClient::new(handle.get_control_socket_path())
            .resume()
            .await
    }

    /// Tears the task's VM down: graceful SIGTERM, SIGKILL after five seconds,
    /// then artifact removal and resource release.
    ///
    /// Idempotent: terminating a task with no live VM is a successful no-op.
    pub async fn terminate(&self, task_id: Uuid) -> LiaResult<()> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let handle = self.handles.write().await.remove(&task_id);
        let child = self.children.lock().await.remove(&task_id);

        if let Some(mut child) = child {
            self.reap(task_id, &mut child).await;
        }

        if let Some(handle) = handle {
            self.remove_artifacts(&handle).await;
            self.free_resources(&handle);
            info!(task_id = %task_id, "vm terminated and cleaned up");
        }

        Ok(())
    }

    /// Best-effort removal of artifacts a cancelled launch may have left
    /// behind before its handle was registered. Paths and the tap name are
    /// fully derived from the task id, so no handle is needed.
    pub async fn scrub(&self, task_id: Uuid) {
        let handle = VmHandle::provision(
            task_id,
            0,
            std::net::Ipv4Addr::UNSPECIFIED,
            self.config.network.bridge_ip.clone(),
            &self.config.hypervisor,
        );
        self.remove_artifacts(&handle).await;
    }

    async fn reap(&self, task_id: Uuid, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(task_id = %task_id, %status, "hypervisor exited");
            }
            Ok(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "failed to reap hypervisor");
            }
            Err(_) => {
                warn!(task_id = %task_id, "hypervisor ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
    }

    async fn launch(
        &self,
        handle: &mut VmHandle,
        task_config: &TaskConfig,
        ssh_public_key: Option<&str>,
        on_progress: &ProgressCallback,
    ) -> LiaResult<Child> {
        self.preflight().await?;
        self.prepare_artifacts(handle, task_config).await?;

        let mut child = self.spawn_hypervisor(handle).await?;

        on_progress(BootStage::WaitingForSocket);
        if let Err(e) = self.wait_for_socket(handle).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        on_progress(BootStage::ConfiguringVm);
        if let Err(e) = self
            .configure(handle, task_config, ssh_public_key)
            .await
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        on_progress(BootStage::BootingVm);
        Ok(child)
    }

    async fn preflight(&self) -> LiaResult<()> {
        let hypervisor = &self.config.hypervisor;
        for (what, path) in [
            ("kernel", &hypervisor.kernel_path),
            ("rootfs template", &hypervisor.rootfs_path),
        ] {
            if !fs::try_exists(path).await.unwrap_or(false) {
                return Err(LiaError::vm_launch(
                    LaunchStep::Preflight,
                    format!("{} missing at {}", what, path),
                ));
            }
        }
        Ok(())
    }

    async fn prepare_artifacts(
        &self,
        handle: &VmHandle,
        task_config: &TaskConfig,
    ) -> LiaResult<()> {
        let hypervisor = &self.config.hypervisor;

        for dir in [
            &hypervisor.volumes_dir,
            &hypervisor.sockets_dir,
            &hypervisor.logs_dir,
            &hypervisor.pids_dir,
            &hypervisor.taps_dir,
        ] {
            fs::create_dir_all(dir).await.map_err(|e| {
                LiaError::vm_launch(LaunchStep::Resources, format!("create {}: {}", dir, e))
            })?;
        }

        // The hypervisor refuses to start when its log file is missing.
        fs::write(handle.get_log_path(), "").await.map_err(|e| {
            LiaError::vm_launch(LaunchStep::Resources, format!("create log file: {}", e))
        })?;

        fs::write(handle.get_tap_record_path(), handle.get_tap_name())
            .await
            .map_err(|e| {
                LiaError::vm_launch(LaunchStep::Resources, format!("record tap name: {}", e))
            })?;

        create_tap(handle.get_tap_name(), &self.config.network.bridge_name).await?;

        self.copy_rootfs(handle).await?;
        self.create_sparse_volume(handle, task_config.storage_gb)
            .await?;

        Ok(())
    }

    /// Copies the rootfs template for this VM. Reflink-capable filesystems
    /// share blocks; everywhere else this degrades to a full copy.
    async fn copy_rootfs(&self, handle: &VmHandle) -> LiaResult<()> {
        let output = Command::new("cp")
            .arg("--reflink=auto")
            .arg(&self.config.hypervisor.rootfs_path)
            .arg(handle.get_rootfs_path())
            .output()
            .await
            .map_err(|e| {
                LiaError::vm_launch(LaunchStep::Resources, format!("copy rootfs: {}", e))
            })?;

        if !output.status.success() {
            return Err(LiaError::vm_launch(
                LaunchStep::Resources,
                format!(
                    "copy rootfs: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(())
    }

    async fn create_sparse_volume(&self, handle: &VmHandle, size_gb: u32) -> LiaResult<()> {
        let file = fs::File::create(handle.get_volume_path()).await.map_err(|e| {
            LiaError::vm_launch(LaunchStep::Resources, format!("create volume: {}", e))
        })?;

        file.set_len((size_gb as u64) * 1024 * 1024 * 1024)
            .await
            .map_err(|e| {
                LiaError::vm_launch(LaunchStep::Resources, format!("size volume: {}", e))
            })?;

        let output = Command::new("mkfs.ext4")
            .arg("-F")
            .arg(handle.get_volume_path())
            .output()
            .await
            .map_err(|e| {
                LiaError::vm_launch(LaunchStep::Resources, format!("format volume: {}", e))
            })?;

        if !output.status.success() {
            return Err(LiaError::vm_launch(
                LaunchStep::Resources,
                format!(
                    "mkfs.ext4 failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(())
    }

    async fn spawn_hypervisor(&self, handle: &mut VmHandle) -> LiaResult<Child> {
        let child = Command::new(&self.config.hypervisor.bin_path)
            .arg("--api-sock")
            .arg(handle.get_control_socket_path())
            .arg("--log-path")
            .arg(handle.get_log_path())
            .arg("--level")
            .arg("Debug")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // A provisioning pipeline cancelled mid-launch must not leave the
            // hypervisor running unsupervised.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LiaError::vm_launch(LaunchStep::ProcessSpawn, format!("spawn hypervisor: {}", e))
            })?;

        handle.set_pid(child.id());

        if let Some(pid) = child.id() {
            if let Err(e) = fs::write(handle.get_pid_path(), pid.to_string()).await {
                warn!(task_id = %handle.get_task_id(), error = %e, "failed to write pid file");
            }
        }

        Ok(child)
    }

    /// The hypervisor only daemonizes its API after the socket is ready, so
    /// existence plus a short settle is enough.
    async fn wait_for_socket(&self, handle: &VmHandle) -> LiaResult<()> {
        for _ in 0..SOCKET_WAIT_ATTEMPTS {
            if fs::try_exists(handle.get_control_socket_path())
                .await
                .unwrap_or(false)
            {
                time::sleep(SOCKET_WAIT_DELAY).await;
                return Ok(());
            }
            time::sleep(SOCKET_WAIT_DELAY).await;
        }

        Err(LiaError::vm_launch(
            LaunchStep::ApiSocket,
            format!(
                "control socket did not appear within {:?}",
                SOCKET_WAIT_DELAY * SOCKET_WAIT_ATTEMPTS
            ),
        ))
    }

    async fn configure(
        &self,
        handle: &VmHandle,
        task_config: &TaskConfig,
        ssh_public_key: Option<&str>,
    ) -> LiaResult<()> {
        let client = HypervisorClient::new(handle.get_control_socket_path());

        // Spaces cannot survive the kernel command line; the guest init
        // decodes '+' back to spaces.
        let ssh_key_arg = ssh_public_key
            .map(|key| format!(" lia.ssh_key={}", key.replace(' ', "+")))
            .unwrap_or_default();

        let boot_args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/init lia.ip={} lia.gateway={}{}",
            handle.get_ip_address(),
            handle.get_gateway(),
            ssh_key_arg
        );

        client
            .put_boot_source(&self.config.hypervisor.kernel_path, boot_args)
            .await?;
        client
            .put_machine_config(task_config.vcpu_count, task_config.max_memory_mb)
            .await?;
        client
            .put_drive("rootfs", handle.get_rootfs_path(), true)
            .await?;
        client
            .put_drive("data", handle.get_volume_path(), false)
            .await?;
        client
            .put_network_interface(
                &mac_for_ip(*handle.get_ip_address()),
                handle.get_tap_name(),
            )
            .await?;
        client
            .put_vsock(*handle.get_cid(), handle.get_vsock_path())
            .await?;
        client.start_instance().await?;

        Ok(())
    }

    /// Removes every per-task artifact except the log file, which is retained
    /// as the post-mortem record served by the logs endpoints.
    async fn remove_artifacts(&self, handle: &VmHandle) {
        delete_tap(handle.get_tap_name()).await;

        for path in [
            handle.get_volume_path(),
            handle.get_rootfs_path(),
            handle.get_vsock_path(),
            handle.get_control_socket_path(),
            handle.get_pid_path(),
            handle.get_tap_record_path(),
        ] {
            let _ = fs::remove_file(path).await;
        }
    }

    fn free_resources(&self, handle: &VmHandle) {
        self.allocator.free_ip(*handle.get_ip_address());
        self.allocator.free_cid(*handle.get_cid());
    }

    async fn require_handle(&self, task_id: Uuid) -> LiaResult<Arc<VmHandle>> {
        self.handle(task_id).await.ok_or_else(|| {
            LiaError::InvalidState(format!("no live vm for task {}", task_id))
        })
    }

    async fn task_lock(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        self.task_locks
            .lock()
            .await
            .entry(task_id)
            .or_default()
            .clone()
    }
}
