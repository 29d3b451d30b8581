pub mod computation;
pub mod config;
pub mod database;
pub mod pipeline;
pub mod scheduler;

pub use computation::{
    ClusterComputation, Computation, ComputationError, DistributedComputation, Stage,
};
pub use database::{ResultRecord, SharedConnection};
pub use pipeline::{run_computations, PipelineError, PipelineReport, StoreHandle};
pub use scheduler::{SchedulerClient, SchedulerError};
