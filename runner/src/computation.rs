pub mod cluster;
pub mod distributed;
pub mod program;

pub use cluster::ClusterStage;
pub use distributed::{DistributedExecutor, DistributedStage, Task, TaskError, TaskGraph};
pub use program::ProgramStage;

use crate::{
    database::{Column, ConnectionError, ResultRecord, SchemaError, SharedConnection, TableSchema},
    scheduler::{SchedulerClient, SchedulerError},
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComputationError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Store error: {0}")]
    Store(#[from] ConnectionError),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Precondition failed: {0}")]
    Precondition(String),
    #[error("Distributed task failed: {0}")]
    Task(#[from] TaskError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComputationError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}

/// Common part of every unit of work in a pipeline
pub trait Computation: Send {
    /// name used for logging and, by default, as the result table
    fn name(&self) -> &str;

    fn table_name(&self) -> &str {
        self.name()
    }

    /// columns of the result table besides the `id` primary key
    fn result_columns(&self) -> Vec<Column>;

    /// runs before `execute`, e.g., to prepare the environment
    fn pre_execution(&mut self, _session: &SharedConnection) -> Result<(), ComputationError> {
        Ok(())
    }

    /// runs after a successful `execute`, before the records are committed
    fn post_execution(&mut self, _session: &SharedConnection) -> Result<(), ComputationError> {
        Ok(())
    }
}

/// Work expressed as shell commands, run as a single array job on the cluster
pub trait ClusterComputation: Computation {
    /// record stubs and commands, aligned by index
    fn make_cmd_list(
        &mut self,
        session: &SharedConnection,
    ) -> Result<(Vec<ResultRecord>, Vec<String>), ComputationError>;
}

/// Work expressed as lazy tasks computing result rows directly
pub trait DistributedComputation: Computation {
    fn make_futures(&mut self, session: &SharedConnection) -> Result<TaskGraph, ComputationError>;
}

/// All supported stage variants, the driver dispatches over them
#[derive(Debug)]
pub enum Stage {
    Cluster(ClusterStage),
    Distributed(DistributedStage),
}

impl Stage {
    pub fn cluster<C: ClusterComputation + 'static>(computation: C, client: SchedulerClient) -> Self {
        Self::Cluster(ClusterStage::new(Box::new(computation), client))
    }

    pub fn distributed<C: DistributedComputation + 'static>(
        computation: C,
        executor: Arc<DistributedExecutor>,
    ) -> Self {
        Self::Distributed(DistributedStage::new(Box::new(computation), executor))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Cluster(stage) => stage.computation().name(),
            Self::Distributed(stage) => stage.computation().name(),
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            Self::Cluster(stage) => stage.computation().table_name(),
            Self::Distributed(stage) => stage.computation().table_name(),
        }
    }

    /// declared schema of the result table, validated on construction
    pub fn schema(&self) -> Result<TableSchema, SchemaError> {
        let columns = match self {
            Self::Cluster(stage) => stage.computation().result_columns(),
            Self::Distributed(stage) => stage.computation().result_columns(),
        };

        TableSchema::new(self.table_name(), columns)
    }

    pub fn pre_execution(&mut self, session: &SharedConnection) -> Result<(), ComputationError> {
        match self {
            Self::Cluster(stage) => stage.computation_mut().pre_execution(session),
            Self::Distributed(stage) => stage.computation_mut().pre_execution(session),
        }
    }

    pub fn post_execution(&mut self, session: &SharedConnection) -> Result<(), ComputationError> {
        match self {
            Self::Cluster(stage) => stage.computation_mut().post_execution(session),
            Self::Distributed(stage) => stage.computation_mut().post_execution(session),
        }
    }

    /// run the stage body and return the records to commit
    pub fn execute(
        &mut self,
        session: &SharedConnection,
    ) -> Result<Vec<ResultRecord>, ComputationError> {
        let schema = self.schema()?;

        match self {
            Self::Cluster(stage) => stage.execute(session),
            Self::Distributed(stage) => stage.execute(session, &schema),
        }
    }

    pub fn successful(&self) -> bool {
        match self {
            Self::Cluster(stage) => stage.successful,
            Self::Distributed(stage) => stage.successful,
        }
    }

    pub(crate) fn set_successful(&mut self, successful: bool) {
        match self {
            Self::Cluster(stage) => stage.successful = successful,
            Self::Distributed(stage) => stage.successful = successful,
        }
    }
}
