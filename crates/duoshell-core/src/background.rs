use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Mutex;

use duoshell_types::{
    BackgroundTask, BackgroundTaskState, CommandResult, CommandSource, TaskPoll, TerminalError,
    TerminalResult,
};

use crate::lock;

/// Commands whose caller stopped waiting, for one session.
///
/// Tasks are never removed automatically; terminal states are final.
#[derive(Debug)]
pub struct BackgroundTaskRegistry {
    session: String,
    tasks: Mutex<HashMap<String, BackgroundTask>>,
}

impl BackgroundTaskRegistry {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Track a command as RUNNING
    pub fn register(
        &self,
        task_id: &str,
        command: &str,
        source: CommandSource,
        started_at: DateTime<Utc>,
    ) {
        let task = BackgroundTask {
            id: task_id.to_string(),
            command: command.to_string(),
            source,
            state: BackgroundTaskState::Running,
            started_at,
            finished_at: None,
            result: None,
            error: None,
        };
        info!("Session '{}' moved {} to the background", self.session, task_id);
        lock(&self.tasks).insert(task_id.to_string(), task);
    }

    /// Record a command's outcome.
    ///
    /// `Cancelled` errors settle as CANCELLED, other errors as FAILED. Returns
    /// false when the task is unknown or already final.
    pub fn settle(&self, task_id: &str, outcome: TerminalResult<CommandResult>) -> bool {
        let mut tasks = lock(&self.tasks);
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        if task.state.is_terminal() {
            debug!(
                "Ignoring late result for task {} in '{}' ({:?})",
                task_id, self.session, task.state
            );
            return false;
        }

        task.finished_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                task.state = BackgroundTaskState::Completed;
                task.result = Some(result);
            }
            Err(error @ TerminalError::Cancelled { .. }) => {
                task.state = BackgroundTaskState::Cancelled;
                task.error = Some(error.to_string());
            }
            Err(error) => {
                task.state = BackgroundTaskState::Failed;
                task.error = Some(error.to_string());
            }
        }
        true
    }

    /// Mark a RUNNING task CANCELLED
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tasks = lock(&self.tasks);
        match tasks.get_mut(task_id) {
            Some(task) if !task.state.is_terminal() => {
                task.state = BackgroundTaskState::Cancelled;
                task.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Cancel every RUNNING task, returning how many were cancelled
    pub fn cancel_running(&self) -> usize {
        let now = Utc::now();
        let mut cancelled = 0;
        for task in lock(&self.tasks).values_mut() {
            if !task.state.is_terminal() {
                task.state = BackgroundTaskState::Cancelled;
                task.finished_at = Some(now);
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn get(&self, task_id: &str) -> TerminalResult<BackgroundTask> {
        lock(&self.tasks)
            .get(task_id)
            .cloned()
            .ok_or_else(|| self.not_found(task_id))
    }

    pub fn poll(&self, task_id: &str) -> TaskPoll {
        match lock(&self.tasks).get(task_id) {
            None => TaskPoll::NotFound,
            Some(task) if task.state.is_terminal() => TaskPoll::Settled(task.clone()),
            Some(task) => TaskPoll::Running(task.clone()),
        }
    }

    /// All tasks, oldest first
    pub fn list(&self) -> Vec<BackgroundTask> {
        let mut tasks: Vec<_> = lock(&self.tasks).values().cloned().collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn remove(&self, task_id: &str) -> TerminalResult<BackgroundTask> {
        lock(&self.tasks)
            .remove(task_id)
            .ok_or_else(|| self.not_found(task_id))
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }

    fn not_found(&self, task_id: &str) -> TerminalError {
        TerminalError::TaskNotFound {
            session: self.session.clone(),
            task_id: task_id.to_string(),
        }
    }
}
