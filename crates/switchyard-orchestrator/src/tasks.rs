//! Registry of in-flight executions.
//!
//! Tasks are kept in a concurrent table keyed by task id, with a secondary
//! index from conversation id to task ids. Cancelling a task aborts its unit
//! of work and removes it; a periodic sweep purges entries whose unregister
//! step was missed.

use crate::error::{OrchestrationError, Result};
use crate::events::{CoreEvent, EventBus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_abstraction::CancellationToken;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Status of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The unit of work is executing.
    Running,
    /// Cancellation has started.
    Cancelling,
    /// The unit of work was terminated.
    Cancelled,
}

/// Snapshot of a tracked task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    /// Opaque task id.
    pub task_id: String,
    /// Engine running the task.
    pub engine: String,
    /// Conversation the task belongs to.
    pub conversation_id: Option<String>,
    /// When the task was registered.
    pub started_at: DateTime<Utc>,
    /// Current status.
    pub status: TaskStatus,
    /// Caller metadata.
    pub metadata: HashMap<String, Value>,
}

/// Handles used to terminate a task's unit of work.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    abort: AbortHandle,
    token: Option<CancellationToken>,
}

impl TaskHandle {
    /// Wraps the abort handle of a spawned unit of work.
    #[must_use]
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort, token: None }
    }

    /// Attaches the request's cancellation token so cancelling the task also cancels it.
    #[must_use]
    pub fn with_token(mut self, token: Option<CancellationToken>) -> Self {
        self.token = token;
        self
    }
}

struct TaskEntry {
    info: TaskInfo,
    handle: TaskHandle,
    status_changed: Instant,
}

impl TaskEntry {
    fn is_stale(&self, retention: Duration) -> bool {
        let settled = self.info.status != TaskStatus::Running || self.handle.abort.is_finished();
        settled && self.status_changed.elapsed() >= retention
    }
}

/// Task registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Tracked tasks.
    pub total: usize,
    /// Tasks still running.
    pub running: usize,
    /// Tasks being cancelled.
    pub cancelling: usize,
    /// Cancelled tasks awaiting removal.
    pub cancelled: usize,
    /// Tasks per engine.
    pub by_engine: BTreeMap<String, usize>,
    /// Conversations with at least one task.
    pub conversations: usize,
}

/// Concurrent registry of in-flight tasks.
pub struct TaskRegistry {
    tasks: DashMap<String, TaskEntry>,
    by_conversation: DashMap<String, HashSet<String>>,
    events: EventBus,
    retention: Duration,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_count", &self.tasks.len())
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl TaskRegistry {
    /// Creates a registry purging settled entries older than `retention`.
    #[must_use]
    pub fn new(events: EventBus, retention: Duration) -> Self {
        Self { tasks: DashMap::new(), by_conversation: DashMap::new(), events, retention }
    }

    /// Registers an in-flight execution.
    ///
    /// # Returns
    /// The generated task id.
    pub fn register(
        &self,
        handle: TaskHandle,
        conversation_id: Option<String>,
        engine: &str,
        metadata: HashMap<String, Value>,
    ) -> String {
        let task_id = loop {
            let candidate = format!("task-{}", uuid::Uuid::new_v4().simple());
            if !self.tasks.contains_key(&candidate) {
                break candidate;
            }
        };

        if let Some(conversation) = &conversation_id {
            self.by_conversation.entry(conversation.clone()).or_default().insert(task_id.clone());
        }

        debug!(task_id = %task_id, engine = %engine, conversation_id = ?conversation_id, "Registering task");

        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                info: TaskInfo {
                    task_id: task_id.clone(),
                    engine: engine.to_string(),
                    conversation_id,
                    started_at: Utc::now(),
                    status: TaskStatus::Running,
                    metadata,
                },
                handle,
                status_changed: Instant::now(),
            },
        );

        task_id
    }

    /// Removes a task.
    ///
    /// # Returns
    /// Returns `true` if the task was tracked.
    pub fn unregister(&self, task_id: &str) -> bool {
        let Some((_, entry)) = self.tasks.remove(task_id) else {
            return false;
        };
        if let Some(conversation) = &entry.info.conversation_id {
            self.remove_from_index(conversation, task_id);
        }
        debug!(task_id = %task_id, "Unregistered task");
        true
    }

    fn remove_from_index(&self, conversation: &str, task_id: &str) {
        if let Some(mut ids) = self.by_conversation.get_mut(conversation) {
            ids.remove(task_id);
        }
        self.by_conversation.remove_if(conversation, |_, ids| ids.is_empty());
    }

    /// Looks up a task by id.
    pub fn find_task(&self, task_id: &str) -> Option<TaskInfo> {
        self.tasks.get(task_id).map(|entry| entry.info.clone())
    }

    /// Returns every task tracked for a conversation.
    pub fn find_by_conversation(&self, conversation_id: &str) -> Vec<TaskInfo> {
        let ids: Vec<String> = self
            .by_conversation
            .get(conversation_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.find_task(id)).collect()
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) -> Option<TaskInfo> {
        let mut entry = self.tasks.get_mut(task_id)?;
        entry.info.status = status;
        entry.status_changed = Instant::now();
        Some(entry.info.clone())
    }

    /// Cancels a task: marks it cancelling, cancels its token, aborts its unit of
    /// work, marks it cancelled and unregisters it.
    ///
    /// # Errors
    /// Returns `OrchestrationError::TaskNotFound` if the task is not tracked.
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        let info = self
            .set_status(task_id, TaskStatus::Cancelling)
            .ok_or_else(|| OrchestrationError::TaskNotFound(task_id.to_string()))?;

        if let Some(entry) = self.tasks.get(task_id) {
            if let Some(token) = &entry.handle.token {
                token.cancel("task cancelled");
            }
            entry.handle.abort.abort();
        }

        self.set_status(task_id, TaskStatus::Cancelled);
        self.unregister(task_id);

        info!(task_id = %task_id, engine = %info.engine, "Task cancelled");
        if info.conversation_id.is_some() {
            self.events.emit(CoreEvent::TaskCancelled {
                task_id: task_id.to_string(),
                conversation_id: info.conversation_id,
            });
        }
        Ok(())
    }

    /// Cancels every task of a conversation.
    ///
    /// # Returns
    /// The number of tasks cancelled.
    pub fn cancel_conversation_tasks(&self, conversation_id: &str) -> usize {
        let tasks = self.find_by_conversation(conversation_id);
        let cancelled = tasks.iter().filter(|t| self.cancel_task(&t.task_id).is_ok()).count();
        if cancelled > 0 {
            info!(conversation_id = %conversation_id, cancelled, "Cancelled conversation tasks");
        }
        cancelled
    }

    /// Returns registry statistics.
    pub fn get_stats(&self) -> TaskStats {
        let mut stats = TaskStats {
            conversations: self.by_conversation.len(),
            ..TaskStats::default()
        };
        for entry in &self.tasks {
            stats.total += 1;
            match entry.info.status {
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Cancelling => stats.cancelling += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            *stats.by_engine.entry(entry.info.engine.clone()).or_default() += 1;
        }
        stats
    }

    /// Purges settled entries older than the retention window.
    ///
    /// # Returns
    /// The number of entries removed.
    pub fn sweep(&self) -> usize {
        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.is_stale(self.retention))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = stale.iter().filter(|id| self.unregister(id)).count();
        if removed > 0 {
            warn!(removed, "Purged stale task entries");
        }
        removed
    }

    /// Spawns the periodic sweep. The loop exits when `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep();
                    }
                    () = shutdown.cancelled() => {
                        debug!("Task sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Returns the number of tracked tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no task is tracked.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
