use super::{ClusterComputation, ComputationError};
use crate::{
    database::{ResultRecord, SharedConnection},
    scheduler::SchedulerClient,
};
use std::fmt;
use tracing::{debug, info};

/// Stage running the commands of a `ClusterComputation` as one array job
pub struct ClusterStage {
    computation: Box<dyn ClusterComputation>,
    client: SchedulerClient,
    pub(super) successful: bool,
}

impl fmt::Debug for ClusterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterStage")
            .field("name", &self.computation.name())
            .field("client", &self.client)
            .field("successful", &self.successful)
            .finish()
    }
}

impl ClusterStage {
    pub fn new(computation: Box<dyn ClusterComputation>, client: SchedulerClient) -> Self {
        Self {
            computation,
            client,
            successful: false,
        }
    }

    pub fn computation(&self) -> &dyn ClusterComputation {
        self.computation.as_ref()
    }

    pub fn computation_mut(&mut self) -> &mut dyn ClusterComputation {
        self.computation.as_mut()
    }

    pub fn client(&self) -> &SchedulerClient {
        &self.client
    }

    /// submit the commands, block until the job left the queue and hand back the stubs
    pub fn execute(
        &mut self,
        session: &SharedConnection,
    ) -> Result<Vec<ResultRecord>, ComputationError> {
        let (records, commands) = self.computation.make_cmd_list(session)?;

        if records.len() != commands.len() {
            return Err(ComputationError::precondition(format!(
                "{} created {} records for {} commands",
                self.computation.name(),
                records.len(),
                commands.len()
            )));
        }

        if commands.is_empty() {
            info!(name = %self.computation.name(), "Nothing to submit");

            return Ok(records);
        }

        if let Some(job) = self.client.submit(&commands)? {
            debug!(job = %job, tasks = commands.len(), "Waiting for array job");
        }
        self.client.wait_default()?;

        Ok(records)
    }
}
