//! Progress reporting for long-running scans.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Receives task lifecycle and progress updates.
pub trait TaskSink: Send + Sync {
    fn start_task(&self, description: &str) -> u64;
    fn set_task_progress(&self, id: u64, progress: u64, max: u64);
    fn set_task_finished(&self, id: u64);
}

/// A running task as seen by [`TaskManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: u64,
    pub description: String,
    pub progress: u64,
    pub max: u64,
}

#[derive(Debug, Default)]
struct Tasks {
    next_id: u64,
    running: BTreeMap<u64, Task>,
}

/// Keeps track of running tasks and logs their progress.
#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Mutex<Tasks>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> Vec<Task> {
        self.tasks.lock().running.values().cloned().collect()
    }
}

impl TaskSink for TaskManager {
    fn start_task(&self, description: &str) -> u64 {
        let mut tasks = self.tasks.lock();
        tasks.next_id += 1;
        let id = tasks.next_id;
        tasks.running.insert(
            id,
            Task {
                id,
                description: description.to_string(),
                progress: 0,
                max: 0,
            },
        );
        tracing::info!(target: "tasks", id, "{}", description);
        id
    }

    fn set_task_progress(&self, id: u64, progress: u64, max: u64) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.running.get_mut(&id) {
            // Log roughly every tenth of the way.
            let step = (max / 10).max(1);
            if progress / step != task.progress / step || max != task.max {
                tracing::debug!(target: "tasks", id, progress, max, "{}", task.description);
            }
            task.progress = progress;
            task.max = max;
        }
    }

    fn set_task_finished(&self, id: u64) {
        if let Some(task) = self.tasks.lock().running.remove(&id) {
            tracing::info!(target: "tasks", id, progress = task.progress, "Finished: {}", task.description);
        }
    }
}
