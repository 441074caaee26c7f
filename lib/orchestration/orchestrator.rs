//! The orchestrator: the detached boot pipeline and the teardown paths.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    hub::{BootStage, HubRegistry, TaskHub},
    relay::{RelayInit, RelayOutcome, RelaySession, VsockRelay},
    store::{Task, TaskConfig, TaskFile, TaskStatus, TaskStore},
    vm::{ProgressCallback, VmManager},
    LiaError, LiaResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Hard wall-clock deadline from `mark_starting` to `mark_running`.
const CREATE_DEADLINE: Duration = Duration::from_secs(30);

/// Settle time between the init frame and announcing the agent ready.
const AGENT_SETTLE: Duration = Duration::from_millis(500);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything the boot pipeline needs beyond the task row itself.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// The initial prompt for the agent.
    pub prompt: String,

    /// Files to materialize in the guest working directory.
    pub files: Option<Vec<TaskFile>>,

    /// Resolved resource configuration for the VM.
    pub task_config: TaskConfig,

    /// SSH public key to inject into the guest, if the caller provided one.
    pub ssh_public_key: Option<String>,
}

/// Coordinates the task store, VM manager, relays and hubs.
///
/// Every detached background pipeline is registered in a cancellation set
/// keyed by task id; teardown cancels and awaits it, never detaches silently.
pub struct Orchestrator {
    config: Arc<AppConfig>,
    store: TaskStore,
    vm: VmManager,
    hubs: HubRegistry,
    relays: RwLock<HashMap<Uuid, RelaySession>>,
    pipelines: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates an orchestrator over the given store.
    pub fn new(config: Arc<AppConfig>, store: TaskStore) -> LiaResult<Self> {
        Ok(Self {
            vm: VmManager::new(config.clone())?,
            config,
            store,
            hubs: HubRegistry::new(),
            relays: RwLock::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// The shared configuration handle.
    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    /// The task store.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// The hub registry.
    pub fn hubs(&self) -> &HubRegistry {
        &self.hubs
    }

    /// Transitions a pending task to starting and spawns the detached boot
    /// pipeline for it. Returns as soon as the pipeline is registered; the
    /// HTTP response does not wait for the VM.
    pub async fn start_task(
        self: &Arc<Self>,
        task: &Task,
        request: ProvisionRequest,
    ) -> LiaResult<()> {
        let cid = self.vm.reserve_cid();
        let vm_id = format!("vm-{}", task.id);

        if let Err(e) = self.store.mark_starting(task.id, &vm_id, cid).await {
            self.vm.release_cid(cid);
            return Err(e);
        }

        let hub = self.hubs.get_or_create(task.id).await;
        hub.publish_status(TaskStatus::Starting, None);

        let orchestrator = self.clone();
        let task_id = task.id;
        let handle = tokio::spawn(async move {
            orchestrator.provision(task_id, cid, request).await;
        });
        self.pipelines.lock().await.insert(task_id, handle);

        Ok(())
    }

    /// The background boot pipeline. Never panics; failures are recorded into
    /// the store and published to the hub.
    async fn provision(self: Arc<Self>, task_id: Uuid, cid: u32, request: ProvisionRequest) {
        let hub = self.hubs.get_or_create(task_id).await;
        hub.publish_progress(BootStage::CreatingVm);

        match time::timeout(
            CREATE_DEADLINE,
            self.boot_pipeline(task_id, cid, &request, &hub),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(task_id = %task_id, "task is running");
                self.pipelines.lock().await.remove(&task_id);
            }
            Ok(Err(e)) => self.fail_provision(task_id, &hub, e).await,
            Err(_) => {
                self.fail_provision(
                    task_id,
                    &hub,
                    LiaError::Internal(anyhow::anyhow!(
                        "boot deadline of {:?} exceeded",
                        CREATE_DEADLINE
                    )),
                )
                .await
            }
        }
    }

    async fn boot_pipeline(
        self: &Arc<Self>,
        task_id: Uuid,
        cid: u32,
        request: &ProvisionRequest,
        hub: &Arc<TaskHub>,
    ) -> LiaResult<()> {
        let progress_hub = hub.clone();
        let on_progress: ProgressCallback =
            Box::new(move |stage| progress_hub.publish_progress(stage));

        let handle = self
            .vm
            .create(
                task_id,
                cid,
                &request.task_config,
                request.ssh_public_key.as_deref(),
                &on_progress,
            )
            .await?;

        hub.publish_progress(BootStage::ConnectingAgent);

        let relay = VsockRelay::new(task_id, handle.get_vsock_path().clone(), hub.clone());
        let (session, outcome_rx) = relay
            .start(RelayInit {
                api_key: self.config.secrets.agent_api_key.clone(),
                prompt: request.prompt.clone(),
                files: request.files.clone(),
            })
            .await?;

        hub.register_input(session.input_sender());
        self.relays.write().await.insert(task_id, session);
        self.spawn_outcome_watcher(task_id, outcome_rx);

        let task = self
            .store
            .mark_running(task_id, &handle.get_ip_address().to_string())
            .await?;
        hub.publish_status(task.status, None);
        hub.touch();

        hub.publish_progress(BootStage::InitializingClaude);
        time::sleep(AGENT_SETTLE).await;
        hub.publish_progress(BootStage::Ready);

        Ok(())
    }

    /// Terminal failure path for the boot pipeline: record, publish, clean up.
    async fn fail_provision(&self, task_id: Uuid, hub: &Arc<TaskHub>, error: LiaError) {
        error!(task_id = %task_id, error = %error, "provisioning failed");

        hub.publish_error(error.to_string());

        match self
            .store
            .mark_terminated(task_id, Some(1), Some(&error.to_string()))
            .await
        {
            Ok(_) => hub.publish_status(TaskStatus::Terminated, Some(1)),
            // Already terminal: a concurrent delete got there first.
            Err(LiaError::InvalidState(_)) => {}
            Err(e) => error!(task_id = %task_id, error = %e, "failed to record failure"),
        }

        if let Some(session) = self.relays.write().await.remove(&task_id) {
            session.stop().await;
        }
        if let Err(e) = self.vm.terminate(task_id).await {
            warn!(task_id = %task_id, error = %e, "cleanup after failed launch");
        }
        self.vm.scrub(task_id).await;

        hub.close();
        self.hubs.release(task_id).await;
        self.pipelines.lock().await.remove(&task_id);
    }

    /// Watches a relay session and drives the task terminal once the guest
    /// exits or the channel breaks.
    fn spawn_outcome_watcher(
        self: &Arc<Self>,
        task_id: Uuid,
        mut outcome_rx: mpsc::Receiver<RelayOutcome>,
    ) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Some(outcome) = outcome_rx.recv().await {
                orchestrator.handle_relay_outcome(task_id, outcome).await;
            }
        });
    }

    async fn handle_relay_outcome(&self, task_id: Uuid, outcome: RelayOutcome) {
        let (exit_code, error_message) = match outcome {
            RelayOutcome::Exited(code) => (Some(code), None),
            RelayOutcome::Disconnected => {
                (Some(1), Some("agent channel closed unexpectedly"))
            }
            // Host-driven teardown is already in charge of the record.
            RelayOutcome::Cancelled => return,
        };

        info!(task_id = %task_id, ?outcome, "relay session ended");
        self.finish_task(task_id, exit_code, error_message).await;
    }

    /// Shared terminal path: record, publish, tear down, release.
    async fn finish_task(
        &self,
        task_id: Uuid,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) {
        match self
            .store
            .mark_terminated(task_id, exit_code, error_message)
            .await
        {
            Ok(_) => {
                if let Some(hub) = self.hubs.get(task_id).await {
                    hub.publish_status(TaskStatus::Terminated, exit_code);
                }
            }
            Err(LiaError::InvalidState(_)) => {}
            Err(e) => error!(task_id = %task_id, error = %e, "failed to mark terminated"),
        }

        if let Some(session) = self.relays.write().await.remove(&task_id) {
            session.stop().await;
        }
        if let Err(e) = self.vm.terminate(task_id).await {
            warn!(task_id = %task_id, error = %e, "vm teardown failed");
        }

        if let Some(hub) = self.hubs.get(task_id).await {
            hub.close();
        }
        self.hubs.release(task_id).await;
    }

    /// Terminates a task on behalf of `DELETE /tasks/{id}`.
    ///
    /// Cancels the boot pipeline if it is still running, stops the relay,
    /// tears the VM down, and records the terminal state. Idempotent: deleting
    /// an already-terminated task succeeds without touching anything.
    pub async fn terminate(&self, task_id: Uuid) -> LiaResult<()> {
        // 404 for unknown ids, before any side effect.
        let task = self.store.get(task_id).await?;

        let pipeline = self.pipelines.lock().await.remove(&task_id);
        if let Some(handle) = pipeline {
            handle.abort();
            let _ = handle.await;
        }

        if let Some(session) = self.relays.write().await.remove(&task_id) {
            session.stop().await;
        }

        self.vm.terminate(task_id).await?;
        self.vm.scrub(task_id).await;

        if !task.status.is_terminal() {
            let task = self.store.mark_terminated(task_id, None, None).await?;
            if let Some(hub) = self.hubs.get(task_id).await {
                hub.publish_status(task.status, task.exit_code);
            }
        }

        if let Some(hub) = self.hubs.get(task_id).await {
            hub.close();
        }
        self.hubs.release(task_id).await;

        Ok(())
    }

    /// Resumes a suspended task: un-pauses the VM, records the transition, and
    /// resets the idle clock.
    pub async fn resume(&self, task_id: Uuid) -> LiaResult<Task> {
        let task = self.store.get(task_id).await?;
        if task.status != TaskStatus::Suspended {
            return Err(LiaError::InvalidState(format!(
                "task is not suspended, current status: {}",
                task.status
            )));
        }

        self.vm.resume(task_id).await?;
        let task = self.store.mark_resumed(task_id).await?;

        if let Some(hub) = self.hubs.get(task_id).await {
            hub.touch();
            hub.publish_status(task.status, None);
        }

        info!(task_id = %task_id, "task resumed");
        Ok(task)
    }

    /// Suspends a running task: pauses the VM and records the transition. The
    /// relay loops stay up; the guest simply stops making progress.
    pub async fn suspend(&self, task_id: Uuid) -> LiaResult<Task> {
        self.vm.pause(task_id).await?;
        let task = self.store.mark_suspended(task_id).await?;

        if let Some(hub) = self.hubs.get(task_id).await {
            hub.publish_status(task.status, None);
        }

        info!(task_id = %task_id, "task suspended after idle timeout");
        Ok(task)
    }

    /// Forwards subscriber input into the task's guest. Returns false when the
    /// task has no live relay.
    pub async fn send_input(&self, task_id: Uuid, data: String) -> bool {
        match self.hubs.get(task_id).await {
            Some(hub) => hub.send_input(data).await,
            None => false,
        }
    }
}
