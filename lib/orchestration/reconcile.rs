//! Startup reconciliation.
//!
//! A previous server process may have died while VMs were live. Rows stuck in
//! a non-terminal, VM-backed status have no handle in this process, so they
//! are transitioned to terminated; stale hypervisor processes named by pid
//! files are killed; tap devices named by record files are removed.

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::fs;
use tracing::{info, warn};

use crate::{store::TaskStatus, vm::delete_tap, LiaResult};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Reconciles durable and host state left behind by a previous process.
    /// Must run before the server starts accepting requests.
    pub async fn reconcile(&self) -> LiaResult<()> {
        self.terminate_orphaned_rows().await?;
        self.kill_stale_hypervisors().await;
        self.remove_stray_taps().await;
        Ok(())
    }

    async fn terminate_orphaned_rows(&self) -> LiaResult<()> {
        let orphaned = self
            .store()
            .list_in_statuses(&[
                TaskStatus::Starting,
                TaskStatus::Running,
                TaskStatus::Suspended,
            ])
            .await?;

        for task in orphaned {
            warn!(task_id = %task.id, status = %task.status, "terminating task orphaned by restart");
            let _ = self
                .store()
                .mark_terminated(task.id, Some(1), Some("orphaned by server restart"))
                .await;
        }

        Ok(())
    }

    async fn kill_stale_hypervisors(&self) {
        let pids_dir = self.config().hypervisor.pids_dir.clone();
        let Ok(mut entries) = fs::read_dir(&pids_dir).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(contents) = fs::read_to_string(entry.path()).await {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    if kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
                        info!(pid, "killed stale hypervisor from previous run");
                    }
                }
            }
            let _ = fs::remove_file(entry.path()).await;
        }
    }

    async fn remove_stray_taps(&self) {
        let taps_dir = self.config().hypervisor.taps_dir.clone();
        let Ok(mut entries) = fs::read_dir(&taps_dir).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(tap_name) = fs::read_to_string(entry.path()).await {
                let tap_name = tap_name.trim();
                if !tap_name.is_empty() {
                    info!(tap_name, "removing stray tap device from previous run");
                    delete_tap(tap_name).await;
                }
            }
            let _ = fs::remove_file(entry.path()).await;
        }
    }
}
