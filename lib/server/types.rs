//! Request and response types for the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    store::{is_valid_repo_name, Task, TaskConfig, TaskFile, TaskSource, TaskStatus},
    LiaError, LiaResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Longest accepted prompt, in bytes.
const MAX_PROMPT_LEN: usize = 100_000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Request body for `POST /api/v1/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// The initial prompt for the agent.
    pub prompt: String,

    /// Repositories in `owner/name` format. At least one is required.
    pub repositories: Vec<String>,

    /// Where the task was created from.
    pub source: TaskSource,

    /// Opaque identifier of the owning user.
    pub user_id: Option<String>,

    /// Group (guild) to associate the task with.
    pub guild_id: Option<String>,

    /// Resource configuration overrides.
    pub config: Option<TaskConfig>,

    /// Files to materialize in the guest working directory.
    pub files: Option<Vec<TaskFile>>,

    /// SSH public key for direct access to the VM.
    pub ssh_public_key: Option<String>,
}

/// A task as returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    /// Task id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Associated group, if any.
    pub guild_id: Option<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Where the task was created from.
    pub source: TaskSource,
    /// Repositories the agent works on.
    pub repositories: Vec<String>,
    /// Assigned VM id.
    pub vm_id: Option<String>,
    /// Resource configuration, when one was supplied.
    pub config: Option<TaskConfig>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First time the task reached running.
    pub started_at: Option<DateTime<Utc>>,
    /// Termination time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Agent exit code.
    pub exit_code: Option<i32>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Stable URL of the task in the browser UI.
    pub web_url: String,
    /// Ready-made SSH command, once the VM has an address.
    pub ssh_command: Option<String>,
    /// IP address of the VM.
    pub ip_address: Option<String>,
}

/// Response body for `GET /api/v1/tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskListResponse {
    /// The requested page of tasks, newest first.
    pub tasks: Vec<TaskResponse>,
    /// Total number of tasks matching the filter.
    pub total: i64,
    /// The requested page (1-based).
    pub page: u32,
    /// Page size.
    pub per_page: u32,
}

/// Query parameters for `GET /api/v1/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListTasksQuery {
    /// Only tasks owned by this user.
    pub user_id: Option<String>,

    /// Only tasks in this status.
    pub status: Option<TaskStatus>,

    /// Page number, 1-based.
    #[serde(default = "default_page")]
    pub page: u32,

    /// Page size, capped at 100.
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

/// Query parameters for the hypervisor log snapshot endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsQuery {
    /// How many trailing lines to return.
    #[serde(default = "default_logs_tail")]
    pub tail: usize,
}

/// Query parameters for the hypervisor log SSE stream.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamLogsQuery {
    /// How many trailing lines to send before live tailing begins.
    #[serde(default = "default_stream_tail")]
    pub tail: usize,
}

/// Response body for the hypervisor log snapshot endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LogsResponse {
    /// The task the log belongs to.
    pub task_id: Uuid,
    /// The requested trailing lines.
    pub lines: Vec<String>,
    /// Total number of lines in the log.
    pub total_lines: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CreateTaskRequest {
    /// Validates the request against the schema. Violations map to 400.
    pub fn validate(&self) -> LiaResult<()> {
        if self.prompt.is_empty() {
            return Err(LiaError::BadRequest("prompt cannot be empty".to_string()));
        }
        if self.prompt.len() > MAX_PROMPT_LEN {
            return Err(LiaError::BadRequest(format!(
                "prompt exceeds {} bytes",
                MAX_PROMPT_LEN
            )));
        }

        if self.repositories.is_empty() {
            return Err(LiaError::BadRequest(
                "at least one repository is required".to_string(),
            ));
        }
        for repo in &self.repositories {
            if !is_valid_repo_name(repo) {
                return Err(LiaError::BadRequest(format!(
                    "invalid repository format: {:?}, expected 'owner/repo'",
                    repo
                )));
            }
        }

        if matches!(self.user_id.as_deref(), Some("")) {
            return Err(LiaError::BadRequest(
                "user_id must not be empty when present".to_string(),
            ));
        }

        Ok(())
    }
}

impl TaskResponse {
    /// Shapes a task row for clients, attaching its group id and computing the
    /// stable web URL.
    pub fn from_task(task: Task, guild_id: Option<String>, web_base_url: &str) -> Self {
        let ssh_command = task.ip_address.as_ref().map(|ip| format!("ssh root@{}", ip));

        Self {
            web_url: format!("{}/tasks/{}", web_base_url, task.id),
            id: task.id,
            user_id: task.user_id,
            guild_id,
            status: task.status,
            source: task.source,
            repositories: task.repositories.0,
            vm_id: task.vm_id,
            config: task.config.map(|c| c.0),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            exit_code: task.exit_code,
            error_message: task.error_message,
            ssh_command,
            ip_address: task.ip_address,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

fn default_logs_tail() -> usize {
    100
}

fn default_stream_tail() -> usize {
    20
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateTaskRequest {
        CreateTaskRequest {
            prompt: "hi".to_string(),
            repositories: vec!["octo/repo".to_string()],
            source: TaskSource::Web,
            user_id: None,
            guild_id: None,
            config: None,
            files: None,
            ssh_public_key: None,
        }
    }

    #[test]
    fn test_validation_accepts_minimal_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let mut r = request();
        r.prompt = String::new();
        assert!(matches!(r.validate(), Err(LiaError::BadRequest(_))));

        let mut r = request();
        r.prompt = "x".repeat(MAX_PROMPT_LEN + 1);
        assert!(matches!(r.validate(), Err(LiaError::BadRequest(_))));

        let mut r = request();
        r.repositories.clear();
        assert!(matches!(r.validate(), Err(LiaError::BadRequest(_))));

        let mut r = request();
        r.repositories = vec!["bad repo".to_string()];
        assert!(matches!(r.validate(), Err(LiaError::BadRequest(_))));

        let mut r = request();
        r.user_id = Some(String::new());
        assert!(matches!(r.validate(), Err(LiaError::BadRequest(_))));
    }

    #[test]
    fn test_response_derives_ssh_and_web_url() {
        let mut task = Task {
            id: Uuid::new_v4(),
            user_id: "u".to_string(),
            status: TaskStatus::Running,
            source: TaskSource::Web,
            repositories: sqlx::types::Json(vec!["a/b".to_string()]),
            vm_id: Some("vm-x".to_string()),
            cid: Some(100),
            config: None,
            ip_address: Some("172.16.0.100".to_string()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error_message: None,
        };
        let id = task.id;

        let response =
            TaskResponse::from_task(task.clone(), Some("g".to_string()), "http://ui.example");
        assert_eq!(response.web_url, format!("http://ui.example/tasks/{}", id));
        assert_eq!(response.ssh_command.as_deref(), Some("ssh root@172.16.0.100"));

        task.ip_address = None;
        let response = TaskResponse::from_task(task, None, "http://ui.example");
        assert!(response.ssh_command.is_none());
    }
}
