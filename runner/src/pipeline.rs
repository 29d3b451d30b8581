use crate::{
    computation::{ComputationError, Stage},
    config::ConnectionConfig,
    database::{ConnectionError, SharedConnection},
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to open the result store: {0}")]
    Store(#[from] ConnectionError),
    #[error("Stage {name} failed: {source}")]
    Stage {
        name: String,
        #[source]
        source: ComputationError,
    },
}

/// Where the results of a pipeline go
#[derive(Debug, Clone)]
pub enum StoreHandle {
    /// an already open session, stays open after the run
    Session(SharedConnection),
    /// open a session for the run and close it afterwards
    Connect(ConnectionConfig),
}

impl From<SharedConnection> for StoreHandle {
    fn from(session: SharedConnection) -> Self {
        Self::Session(session)
    }
}

impl From<ConnectionConfig> for StoreHandle {
    fn from(config: ConnectionConfig) -> Self {
        Self::Connect(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub name: String,
    pub table: String,
    pub records: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn records(&self) -> usize {
        self.stages.iter().map(|stage| stage.records).sum()
    }
}

/// run a single stage and commit its records, returns the number of stored records
#[instrument(skip_all, fields(stage = stage.name()), level = "info")]
pub fn run_stage(stage: &mut Stage, session: &SharedConnection) -> Result<usize, ComputationError> {
    let schema = session.register(&stage.schema()?)?;

    stage.pre_execution(session)?;
    let records = stage.execute(session)?;
    stage.post_execution(session)?;

    let stored = session.store_iter(schema.table(), records)?;
    stage.set_successful(true);

    Ok(stored)
}

/// Run all stages in order, the records of each stage are committed before the next starts
/// The first failing stage aborts the run, records of earlier stages stay committed
pub fn run_computations(
    stages: &mut [Stage],
    store: impl Into<StoreHandle>,
) -> Result<PipelineReport, PipelineError> {
    let (session, owned) = match store.into() {
        StoreHandle::Session(session) => (session, false),
        StoreHandle::Connect(config) => (SharedConnection::load(&config)?, true),
    };

    let mut report = PipelineReport::default();
    let result = stages.iter_mut().try_for_each(|stage| {
        let name = stage.name().to_owned();
        let start = Instant::now();

        info!("Running {name}");

        match run_stage(stage, &session) {
            Ok(records) => {
                let elapsed = start.elapsed();
                info!("{name} done in {:.2}s", elapsed.as_secs_f64());

                report.stages.push(StageReport {
                    name,
                    table: stage.table_name().to_owned(),
                    records,
                    elapsed,
                });

                Ok(())
            }
            Err(source) => {
                error!(error = %source, "{name} failed");

                Err(PipelineError::Stage { name, source })
            }
        }
    });

    let closed = if owned { session.close() } else { Ok(()) };

    result?;
    closed?;

    Ok(report)
}
