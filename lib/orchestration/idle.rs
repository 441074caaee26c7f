//! Idle watchdog: suspends running tasks nobody is talking to.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time};
use tracing::{debug, warn};

use crate::store::TaskStatus;

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often the watchdog looks for idle tasks.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Spawns the idle watchdog.
    ///
    /// A running task that has produced no non-heartbeat output and received
    /// no subscriber input for `vm.idle_timeout_minutes` is paused; resuming
    /// resets its idle clock.
    pub fn spawn_idle_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut tick = time::interval(IDLE_POLL_INTERVAL);
            loop {
                tick.tick().await;
                orchestrator.suspend_idle_tasks().await;
            }
        })
    }

    async fn suspend_idle_tasks(&self) {
        let idle_limit_secs = self.config().vm.idle_timeout_minutes * 60.0;
        if idle_limit_secs <= 0.0 {
            return;
        }

        let running = match self.store().list_in_statuses(&[TaskStatus::Running]).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "idle watchdog could not list running tasks");
                return;
            }
        };

        for task in running {
            let Some(hub) = self.hubs().get(task.id).await else {
                continue;
            };

            let idle = hub.idle_seconds();
            if idle < idle_limit_secs {
                continue;
            }

            debug!(task_id = %task.id, idle_secs = idle, "task hit idle limit");
            if let Err(e) = self.suspend(task.id).await {
                // Lost a race with termination or the VM is gone; the next
                // tick will see consistent state.
                warn!(task_id = %task.id, error = %e, "idle suspend failed");
            }
        }
    }
}
