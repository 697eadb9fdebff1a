use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskPhase};

/// Rejection of a completion report. Carried inside the RPC reply so a
/// worker can tell a lost race from a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TaskError {
    /// The task is not currently handed out: it either timed out and went
    /// back to the pending pool, or another worker already completed it.
    #[error("{phase} task {task_num} is not in progress")]
    NotInProgress { phase: TaskPhase, task_num: usize },
}

#[tarpc::service]
pub trait MapReduce {
    /// The job's reduce fan-out. Workers ask once at startup; they need it
    /// to partition map output.
    async fn get_reduce_n() -> usize;
    /// Hands out the next task. Blocks while every remaining task is in
    /// progress elsewhere; returns `Task::Exit` once the job is done.
    async fn get_task() -> Task;
    /// Marks a map task completed. Errors if the task is not in progress.
    async fn complete_map_task(task_num: usize) -> Result<(), TaskError>;
    /// Marks a reduce task completed. Errors if the task is not in progress.
    async fn complete_reduce_task(task_num: usize) -> Result<(), TaskError>;
}
