//! Domain models for tasks and their configuration.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Accepted repository names: `owner/name`, both segments limited to
/// alphanumerics, dots, underscores and dashes.
static REPO_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+/[A-Za-z0-9._-]+$").unwrap());

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle status of a task.
///
/// Transitions follow a fixed graph: `pending → starting → running ⇄ suspended`,
/// with every non-terminal status allowed to jump to `terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Row inserted, no VM work started yet.
    Pending,
    /// VM allocation and boot in progress.
    Starting,
    /// The guest agent is reachable.
    Running,
    /// The VM is paused by the idle watchdog.
    Suspended,
    /// Terminal. `completed_at` is set exactly when this is reached.
    Terminated,
}

/// Where a task was created from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    /// Created through the chat front-end.
    Discord,
    /// Created through the browser UI.
    #[default]
    Web,
}

/// Per-task resource configuration, written once at create time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Wall-clock budget for the task in minutes.
    #[serde(default = "default_timeout")]
    pub timeout_minutes: u32,

    /// Memory ceiling in MiB.
    #[serde(default = "default_memory")]
    pub max_memory_mb: u32,

    /// Number of vCPUs.
    #[serde(default = "default_vcpu")]
    pub vcpu_count: u32,

    /// Data volume size in GiB.
    #[serde(default = "default_storage")]
    pub storage_gb: u32,
}

/// A task row: one conversation session bound to exactly one VM.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    /// Task id (UUID v4).
    pub id: Uuid,

    /// Opaque identifier of the owning user.
    pub user_id: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Where the task was created from.
    pub source: TaskSource,

    /// Repositories (`owner/name`) the agent works on.
    pub repositories: sqlx::types::Json<Vec<String>>,

    /// Identifier of the VM assigned to this task.
    pub vm_id: Option<String>,

    /// The vsock context id assigned to this task's VM.
    pub cid: Option<u32>,

    /// Resource configuration, when the caller supplied one.
    pub config: Option<sqlx::types::Json<TaskConfig>>,

    /// IP address assigned to the VM.
    pub ip_address: Option<String>,

    /// When the row was inserted.
    pub created_at: DateTime<Utc>,

    /// When the task first reached `running`, if it ever did.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached `terminated`.
    pub completed_at: Option<DateTime<Utc>>,

    /// Exit code reported by the guest agent.
    pub exit_code: Option<i32>,

    /// Error description when the task failed.
    pub error_message: Option<String>,
}

/// Association of a task with an opaque group identifier.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskGroup {
    /// The associated task.
    pub task_id: Uuid,

    /// Opaque group identifier.
    pub group_id: String,

    /// When the association was created.
    pub created_at: DateTime<Utc>,
}

/// A file to materialize inside the guest's working directory before the agent
/// starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    /// File name relative to the working directory.
    pub name: String,

    /// File contents.
    pub content: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Terminated)
    }

    /// Whether a transition from `self` to `next` is a path in the status
    /// graph.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Pending, Terminated)
                | (Starting, Terminated)
                | (Running, Terminated)
                | (Suspended, Terminated)
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Starting => "starting",
            TaskStatus::Running => "running",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Terminated => "terminated",
        };
        write!(f, "{}", status)
    }
}

impl std::fmt::Display for TaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskSource::Discord => write!(f, "discord"),
            TaskSource::Web => write!(f, "web"),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout(),
            max_memory_mb: default_memory(),
            vcpu_count: default_vcpu(),
            storage_gb: default_storage(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks whether `repo` is a valid `owner/name` repository reference.
pub fn is_valid_repo_name(repo: &str) -> bool {
    REPO_PATTERN.is_match(repo)
}

fn default_timeout() -> u32 {
    30
}

fn default_memory() -> u32 {
    2048
}

fn default_vcpu() -> u32 {
    2
}

fn default_storage() -> u32 {
    50
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_name_validation() {
        assert!(is_valid_repo_name("octo/repo"));
        assert!(is_valid_repo_name("some.org/my-repo_2"));

        assert!(!is_valid_repo_name("bad repo"));
        assert!(!is_valid_repo_name("norepo"));
        assert!(!is_valid_repo_name("a/b/c"));
        assert!(!is_valid_repo_name("owner/"));
        assert!(!is_valid_repo_name("/repo"));
    }

    #[test]
    fn test_status_graph_closure() {
        use TaskStatus::*;

        let all = [Pending, Starting, Running, Suspended, Terminated];

        // Forward path plus suspend/resume.
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));

        // Every non-terminal status may terminate; terminated is absorbing.
        for status in all {
            if status.is_terminal() {
                assert!(!all.iter().any(|next| status.can_transition_to(*next)));
            } else {
                assert!(status.can_transition_to(Terminated));
            }
        }

        // No skipping forward.
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Suspended));
        assert!(!Starting.can_transition_to(Suspended));
        assert!(!Terminated.can_transition_to(Running));
    }

    #[test]
    fn test_task_config_defaults() {
        let config: TaskConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TaskConfig::default());
        assert_eq!(config.timeout_minutes, 30);
        assert_eq!(config.max_memory_mb, 2048);
        assert_eq!(config.vcpu_count, 2);
        assert_eq!(config.storage_gb, 50);
    }
}
