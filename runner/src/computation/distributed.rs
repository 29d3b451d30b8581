//! Lazily evaluated tasks executed on a local worker pool.
//!
//! A `TaskGraph` is a list of independent tasks, each producing one result row. Tasks can be
//! chained with `Task::then`, the chain runs on a single worker. Rows are returned in the
//! order the tasks were added, independent of the order they finished in.

use super::{ComputationError, DistributedComputation};
use crate::database::{ResultRecord, Row, SharedConnection, TableSchema};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task {task} failed: {message}")]
    Failed { task: String, message: String },
    #[error("task {0} panicked")]
    Panicked(String),
    #[error("failed to create worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl TaskError {
    pub fn failed(task: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Failed {
            task: task.into(),
            message: message.to_string(),
        }
    }
}

type TaskFn = Box<dyn FnOnce() -> Result<Row, TaskError> + Send>;

pub struct Task {
    label: String,
    run: TaskFn,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("label", &self.label).finish()
    }
}

impl Task {
    pub fn new<F>(label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Result<Row, TaskError> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(run),
        }
    }

    /// feed the row of this task into `next`
    pub fn then<F>(self, next: F) -> Self
    where
        F: FnOnce(Row) -> Result<Row, TaskError> + Send + 'static,
    {
        let Self { label, run } = self;

        Self {
            label,
            run: Box::new(move || run().and_then(next)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn compute(self) -> Result<Row, TaskError> {
        let Self { label, run } = self;

        panic::catch_unwind(AssertUnwindSafe(run)).unwrap_or(Err(TaskError::Panicked(label)))
    }
}

#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(Task::label)
    }
}

impl FromIterator<Task> for TaskGraph {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self {
            tasks: iter.into_iter().collect(),
        }
    }
}

/// Fixed size pool of worker threads, can be shared between stages
#[derive(Debug)]
pub struct DistributedExecutor {
    pool: ThreadPool,
}

impl DistributedExecutor {
    /// `workers == 0` uses one worker per logical core
    pub fn new(workers: usize) -> Result<Self, TaskError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("batchflow-worker-{index}"))
            .build()?;

        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// evaluate all tasks, the first failure aborts the whole graph
    #[instrument(skip_all, fields(tasks = graph.len()))]
    pub fn compute(&self, graph: TaskGraph) -> Result<Vec<Row>, TaskError> {
        let TaskGraph { tasks } = graph;

        self.pool
            .install(|| tasks.into_par_iter().map(Task::compute).collect())
    }
}

/// Stage evaluating the task graph of a `DistributedComputation`
pub struct DistributedStage {
    computation: Box<dyn DistributedComputation>,
    executor: Arc<DistributedExecutor>,
    pub(super) successful: bool,
}

impl fmt::Debug for DistributedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedStage")
            .field("name", &self.computation.name())
            .field("executor", &self.executor)
            .field("successful", &self.successful)
            .finish()
    }
}

impl DistributedStage {
    pub fn new(
        computation: Box<dyn DistributedComputation>,
        executor: Arc<DistributedExecutor>,
    ) -> Self {
        Self {
            computation,
            executor,
            successful: false,
        }
    }

    pub fn computation(&self) -> &dyn DistributedComputation {
        self.computation.as_ref()
    }

    pub fn computation_mut(&mut self) -> &mut dyn DistributedComputation {
        self.computation.as_mut()
    }

    /// compute all rows and unpack them into records of `schema`
    pub fn execute(
        &mut self,
        session: &SharedConnection,
        schema: &TableSchema,
    ) -> Result<Vec<ResultRecord>, ComputationError> {
        let graph = self.computation.make_futures(session)?;
        debug!(name = %self.computation.name(), tasks = graph.len(), "Computing task graph");

        let rows = self.executor.compute(graph)?;

        rows.into_iter()
            .map(|row| -> Result<ResultRecord, ComputationError> {
                let record = ResultRecord::from_row(schema.table(), row)?;
                schema.validate(&record)?;

                Ok(record)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Value;
    use std::{thread, time::Duration};

    fn row(id: i64) -> Row {
        Row::from([("id".to_owned(), Value::Integer(id))])
    }

    #[test]
    fn rows_keep_task_order() {
        let executor = DistributedExecutor::new(4).unwrap();
        let graph = (0..16)
            .map(|index| {
                Task::new(format!("task-{index}"), move || {
                    // later tasks finish first
                    thread::sleep(Duration::from_millis(16 - index as u64));
                    Ok(row(index))
                })
            })
            .collect::<TaskGraph>();

        let rows = executor.compute(graph).unwrap();
        let ids = rows.iter().map(|row| row["id"].clone()).collect::<Vec<_>>();

        assert_eq!(ids, (0..16).map(Value::Integer).collect::<Vec<_>>());
    }

    #[test]
    fn chained_tasks_see_previous_row() {
        let executor = DistributedExecutor::new(2).unwrap();
        let task = Task::new("chain", || Ok(row(1))).then(|mut row| {
            row.insert("energy".to_owned(), Value::Real(-1.5));
            Ok(row)
        });

        let rows = executor.compute(TaskGraph::from_iter([task])).unwrap();

        assert_eq!(rows[0].get("energy"), Some(&Value::Real(-1.5)));
    }

    #[test]
    fn failures_and_panics_abort() {
        let executor = DistributedExecutor::new(2).unwrap();

        let failing = TaskGraph::from_iter([
            Task::new("ok", || Ok(row(1))),
            Task::new("broken", || Err(TaskError::failed("broken", "no output"))),
        ]);
        assert!(matches!(
            executor.compute(failing),
            Err(TaskError::Failed { task, .. }) if task == "broken"
        ));

        let panicking = TaskGraph::from_iter([Task::new("panics", || panic!("boom"))]);
        assert!(matches!(
            executor.compute(panicking),
            Err(TaskError::Panicked(task)) if task == "panics"
        ));
    }

    #[test]
    fn empty_graph() {
        let executor = DistributedExecutor::new(1).unwrap();

        assert!(executor.compute(TaskGraph::new()).unwrap().is_empty());
        assert_eq!(executor.workers(), 1);
    }
}
