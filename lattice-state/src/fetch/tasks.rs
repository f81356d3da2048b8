//! Task Lifecycle Manager
//!
//! Tracks remote tasks per resolution-instance key ("scope"). Starting a new
//! task for a scope first cancels whatever was still running there, unless
//! the scope is already owned by a newer fetch generation. Task statuses
//! arrive through notifications, possibly before the fetch that created the
//! task has returned, so unknown ids are buffered.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Buffered statuses for tasks nobody tracks yet.
const EARLY_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Outcome of [`TaskManager::start_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStart {
    /// The id was already tracked; the caller shares it.
    Joined,
    /// A new task; `superseded` lists the ids it cancelled.
    Started { superseded: Vec<String> },
    /// A newer generation owns the scope; the task was not tracked.
    Stale,
}

/// How a tracked task ended when it did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    Cancelled,
    Failed(String),
}

struct TrackedTask {
    scope: String,
    status: watch::Sender<TaskStatus>,
    holders: usize,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<String, TrackedTask>,
    scopes: HashMap<String, IndexSet<String>>,
    /// Newest fetch generation that started a task, per scope.
    owners: HashMap<String, u64>,
    early: IndexMap<String, TaskStatus>,
}

impl TaskTable {
    fn cancel_scope(&mut self, scope: &str) -> Vec<String> {
        let ids = self.scopes.remove(scope).unwrap_or_default();
        for id in &ids {
            if let Some(task) = self.tasks.remove(id) {
                task.status.send_replace(TaskStatus::Cancelled);
            }
        }
        if !ids.is_empty() {
            debug!(scope, count = ids.len(), "cancelled running tasks");
        }
        ids.into_iter().collect()
    }

    fn untrack(&mut self, task_id: &str) -> Option<TrackedTask> {
        let task = self.tasks.remove(task_id)?;
        if let Some(ids) = self.scopes.get_mut(&task.scope) {
            ids.shift_remove(task_id);
            if ids.is_empty() {
                self.scopes.remove(&task.scope);
            }
        }
        Some(task)
    }
}

#[derive(Default)]
pub struct TaskManager {
    table: Mutex<TaskTable>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and forget every running task of `scope`. Returns their ids so
    /// the caller can ask the server to stop them.
    pub fn cleanup_running_tasks(&self, scope: &str) -> Vec<String> {
        self.table.lock().cancel_scope(scope)
    }

    /// Track `task_id` under `scope` for the fetch of `generation`.
    ///
    /// A caller that receives a task id already tracked joins it. A task from
    /// a generation older than the scope's owner is refused. Otherwise
    /// whatever still runs under `scope` is cancelled first, in the same
    /// critical section, so a scope never holds two live tasks.
    pub fn start_task(&self, task_id: &str, scope: &str, generation: u64) -> TaskStart {
        let mut table = self.table.lock();
        if let Some(task) = table.tasks.get_mut(task_id) {
            task.holders += 1;
            return TaskStart::Joined;
        }
        if table.owners.get(scope).is_some_and(|owner| *owner > generation) {
            trace!(task_id, scope, generation, "refusing task of superseded fetch");
            return TaskStart::Stale;
        }

        table.owners.insert(scope.to_string(), generation);
        let superseded = table.cancel_scope(scope);
        let initial = table
            .early
            .shift_remove(task_id)
            .unwrap_or(TaskStatus::Running);
        trace!(task_id, scope, status = ?initial, "tracking task");
        let (status, _) = watch::channel(initial);
        table.tasks.insert(
            task_id.to_string(),
            TrackedTask {
                scope: scope.to_string(),
                status,
                holders: 1,
            },
        );
        table
            .scopes
            .entry(scope.to_string())
            .or_default()
            .insert(task_id.to_string());
        TaskStart::Started { superseded }
    }

    pub fn is_tracked(&self, task_id: &str) -> bool {
        self.table.lock().tasks.contains_key(task_id)
    }

    /// Wait until the task reaches a terminal status. A task that is not
    /// tracked, or stops being tracked, counts as cancelled.
    pub async fn wait_for_task(&self, task_id: &str) -> Result<(), TaskFailure> {
        let mut status = {
            let table = self.table.lock();
            match table.tasks.get(task_id) {
                Some(task) => task.status.subscribe(),
                None => return Err(TaskFailure::Cancelled),
            }
        };

        loop {
            let current = status.borrow_and_update().clone();
            match current {
                TaskStatus::Running => {}
                TaskStatus::Completed => return Ok(()),
                TaskStatus::Failed(message) => return Err(TaskFailure::Failed(message)),
                TaskStatus::Cancelled => return Err(TaskFailure::Cancelled),
            }
            if status.changed().await.is_err() {
                return Err(TaskFailure::Cancelled);
            }
        }
    }

    /// Release one holder of the task; the last one untracks it.
    pub fn end_task(&self, task_id: &str) {
        let mut table = self.table.lock();
        let Some(task) = table.tasks.get_mut(task_id) else {
            return;
        };
        task.holders = task.holders.saturating_sub(1);
        if task.holders == 0 {
            table.untrack(task_id);
        }
    }

    /// Record a status pushed by the server.
    pub fn notify(&self, task_id: &str, status: TaskStatus) {
        let mut table = self.table.lock();
        if let Some(task) = table.tasks.get(task_id) {
            task.status.send_replace(status);
            return;
        }
        if !status.is_terminal() {
            return;
        }
        trace!(task_id, "buffering status of untracked task");
        table.early.insert(task_id.to_string(), status);
        if table.early.len() > EARLY_BUFFER {
            table.early.shift_remove_index(0);
        }
    }

    /// Ids of the tasks tracked under `scope`, oldest first.
    pub fn active_tasks(&self, scope: &str) -> Vec<String> {
        self.table
            .lock()
            .scopes
            .get(scope)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancel everything. Returns the ids that were running.
    pub fn clear(&self) -> Vec<String> {
        let mut table = self.table.lock();
        let tasks = std::mem::take(&mut table.tasks);
        table.scopes.clear();
        table.owners.clear();
        table.early.clear();
        tasks
            .into_iter()
            .map(|(id, task)| {
                task.status.send_replace(TaskStatus::Cancelled);
                id
            })
            .collect()
    }
}

/// Releases a task hold when dropped.
pub struct TaskGuard<'a> {
    tasks: &'a TaskManager,
    task_id: String,
}

impl<'a> TaskGuard<'a> {
    pub fn new(tasks: &'a TaskManager, task_id: &str) -> Self {
        Self {
            tasks,
            task_id: task_id.to_string(),
        }
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.tasks.end_task(&self.task_id);
    }
}
