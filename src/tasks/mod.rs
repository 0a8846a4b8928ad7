use crate::bus::{Envelope, EventBus, events};
use crate::errors::{MxfError, ValidationIssue};
use crate::memory::SqliteStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Agent id → the task it is currently working on. Shared between the
/// runtime (set on assignment) and the `task_complete` tool (cleared on
/// completion).
pub type ActiveTaskMap = Arc<tokio::sync::RwLock<HashMap<String, String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Assigned)
                | (Self::Pending, Self::Cancelled)
                | (Self::Assigned, Self::InProgress)
                | (Self::Assigned, Self::Completed)
                | (Self::Assigned, Self::Failed)
                | (Self::Assigned, Self::Cancelled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "channelId")]
    pub channel_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(rename = "assigneeAgentId", skip_serializing_if = "Option::is_none")]
    pub assignee_agent_id: Option<String>,
    /// Percent complete, monotonic non-decreasing.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A candidate for intelligent assignment: agent id plus capability tags.
#[derive(Debug, Clone)]
pub struct AssignmentCandidate {
    pub agent_id: String,
    pub capabilities: Vec<String>,
}

/// Task lifecycle service. A task reaches `completed` only through the
/// `task_complete` tool of its assignee (or the configured completion agent);
/// cancellation is reserved for the assigner or a channel admin.
pub struct TaskService {
    store: Arc<SqliteStore>,
    bus: Arc<EventBus>,
    /// Agents allowed to complete tasks they are not assigned to.
    completion_agent: Option<String>,
    /// Round-robin cursor per channel for fallback assignment.
    round_robin: Mutex<HashMap<String, usize>>,
}

impl TaskService {
    pub fn new(store: Arc<SqliteStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            completion_agent: None,
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_completion_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.completion_agent = Some(agent_id.into());
        self
    }

    fn persist(&self, task: &Task) -> Result<(), MxfError> {
        let payload = serde_json::to_string(task).map_err(|e| MxfError::Internal(e.into()))?;
        let status = serde_json::to_value(task.status)
            .ok()
            .and_then(|v| v.as_str().map(ToString::to_string))
            .unwrap_or_default();
        self.store
            .put_task(
                &task.task_id,
                &task.channel_id,
                &payload,
                &status,
                &task.updated_at.to_rfc3339(),
            )
            .map_err(MxfError::Internal)
    }

    pub fn get(&self, task_id: &str) -> Result<Task, MxfError> {
        let payload = self
            .store
            .get_task(task_id)
            .map_err(MxfError::Internal)?
            .ok_or_else(|| MxfError::NotFound(format!("task '{}'", task_id)))?;
        serde_json::from_str(&payload).map_err(|e| MxfError::Internal(e.into()))
    }

    pub fn list(&self, channel_id: &str) -> Result<Vec<Task>, MxfError> {
        let payloads = self.store.list_tasks(channel_id).map_err(MxfError::Internal)?;
        Ok(payloads
            .iter()
            .filter_map(|p| serde_json::from_str(p).ok())
            .collect())
    }

    async fn emit(&self, event_type: &str, task: &Task) {
        self.bus
            .emit(
                Envelope::new(event_type, json!(task))
                    .with_channel(task.channel_id.clone())
                    .with_agent(
                        task.assignee_agent_id
                            .clone()
                            .unwrap_or_else(|| task.created_by.clone()),
                    ),
            )
            .await;
    }

    pub async fn create(
        &self,
        channel_id: &str,
        title: &str,
        description: &str,
        priority: TaskPriority,
        created_by: &str,
    ) -> Result<Task, MxfError> {
        if title.trim().is_empty() {
            return Err(MxfError::validation(
                "task title must not be empty",
                vec![ValidationIssue::error("/title", "must not be empty")],
            ));
        }
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            priority,
            status: TaskStatus::Pending,
            assignee_agent_id: None,
            progress: 0,
            result: None,
            error: None,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.persist(&task)?;
        info!("task {} created in {} ({})", task.task_id, channel_id, title);
        self.emit(events::TASK_CREATED, &task).await;
        Ok(task)
    }

    fn transition(task: &mut Task, next: TaskStatus) -> Result<(), MxfError> {
        if !task.status.can_transition_to(next) {
            return Err(MxfError::Operation(format!(
                "task '{}' cannot transition {:?} -> {:?}",
                task.task_id, task.status, next
            )));
        }
        task.status = next;
        task.updated_at = Utc::now();
        if next.is_terminal() {
            task.completed_at = Some(task.updated_at);
        }
        Ok(())
    }

    pub async fn assign(&self, task_id: &str, agent_id: &str) -> Result<Task, MxfError> {
        let mut task = self.get(task_id)?;
        Self::transition(&mut task, TaskStatus::Assigned)?;
        task.assignee_agent_id = Some(agent_id.to_string());
        self.persist(&task)?;
        self.emit(events::TASK_ASSIGNED, &task).await;
        Ok(task)
    }

    /// Intelligent assignment with round-robin fallback: candidates claiming
    /// a matching capability tag are rotated through per channel. With no
    /// capability match, all candidates are eligible.
    pub async fn assign_intelligent(
        &self,
        task_id: &str,
        candidates: &[AssignmentCandidate],
        required_capability: Option<&str>,
    ) -> Result<Task, MxfError> {
        if candidates.is_empty() {
            return Err(MxfError::Operation("no assignment candidates".to_string()));
        }
        let task = self.get(task_id)?;

        let eligible: Vec<&AssignmentCandidate> = match required_capability {
            Some(capability) => {
                let matching: Vec<&AssignmentCandidate> = candidates
                    .iter()
                    .filter(|c| c.capabilities.iter().any(|cap| cap == capability))
                    .collect();
                if matching.is_empty() {
                    candidates.iter().collect()
                } else {
                    matching
                }
            }
            None => candidates.iter().collect(),
        };

        let index = {
            let mut cursors = self.round_robin.lock().await;
            let cursor = cursors.entry(task.channel_id.clone()).or_insert(0);
            let index = *cursor % eligible.len();
            *cursor = cursor.wrapping_add(1);
            index
        };
        let chosen = eligible[index].agent_id.clone();
        debug!("task {}: round-robin assigned to {}", task_id, chosen);
        self.assign(task_id, &chosen).await
    }

    pub async fn start(&self, task_id: &str, agent_id: &str) -> Result<Task, MxfError> {
        let mut task = self.get(task_id)?;
        if task.assignee_agent_id.as_deref() != Some(agent_id) {
            return Err(MxfError::Operation(format!(
                "task '{}' is not assigned to {}",
                task_id, agent_id
            )));
        }
        Self::transition(&mut task, TaskStatus::InProgress)?;
        self.persist(&task)?;
        Ok(task)
    }

    pub async fn update_progress(
        &self,
        task_id: &str,
        agent_id: &str,
        progress: u8,
    ) -> Result<Task, MxfError> {
        let mut task = self.get(task_id)?;
        if task.assignee_agent_id.as_deref() != Some(agent_id) {
            return Err(MxfError::Operation(format!(
                "task '{}' is not assigned to {}",
                task_id, agent_id
            )));
        }
        if task.status.is_terminal() {
            return Err(MxfError::Operation(format!(
                "task '{}' is already {:?}",
                task_id, task.status
            )));
        }
        let progress = progress.min(100);
        if progress < task.progress {
            return Err(MxfError::validation(
                "progress is monotonic non-decreasing",
                vec![ValidationIssue::error(
                    "/progress",
                    format!("{} < current {}", progress, task.progress),
                )],
            ));
        }
        task.progress = progress;
        task.updated_at = Utc::now();
        self.persist(&task)?;
        self.emit(events::TASK_PROGRESS_UPDATED, &task).await;
        Ok(task)
    }

    fn may_complete(&self, task: &Task, agent_id: &str) -> bool {
        task.assignee_agent_id.as_deref() == Some(agent_id)
            || self.completion_agent.as_deref() == Some(agent_id)
    }

    /// Terminal transition driven by the `task_complete` tool. `success =
    /// false` lands in `failed` with the summary recorded as the error.
    pub async fn complete(
        &self,
        task_id: &str,
        agent_id: &str,
        summary: &str,
        success: bool,
    ) -> Result<Task, MxfError> {
        let mut task = self.get(task_id)?;
        if !self.may_complete(&task, agent_id) {
            return Err(MxfError::Operation(format!(
                "agent {} may not complete task '{}'",
                agent_id, task_id
            )));
        }
        if success {
            Self::transition(&mut task, TaskStatus::Completed)?;
            task.progress = 100;
            task.result = Some(summary.to_string());
        } else {
            Self::transition(&mut task, TaskStatus::Failed)?;
            task.error = Some(summary.to_string());
        }
        self.persist(&task)?;
        info!(
            "task {} {} by {}",
            task_id,
            if success { "completed" } else { "failed" },
            agent_id
        );
        let event = if success {
            events::TASK_COMPLETED
        } else {
            events::TASK_FAILED
        };
        self.emit(event, &task).await;
        Ok(task)
    }

    /// Only the assigner or a channel admin may cancel.
    pub async fn cancel(
        &self,
        task_id: &str,
        by: &str,
        is_channel_admin: bool,
    ) -> Result<Task, MxfError> {
        let mut task = self.get(task_id)?;
        if task.created_by != by && !is_channel_admin {
            return Err(MxfError::Operation(format!(
                "{} may not cancel task '{}'",
                by, task_id
            )));
        }
        Self::transition(&mut task, TaskStatus::Cancelled)?;
        self.persist(&task)?;
        self.emit(events::TASK_CANCELLED, &task).await;
        Ok(task)
    }
}
