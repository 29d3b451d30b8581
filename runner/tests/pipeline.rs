use batchflow::{
    computation::{
        ClusterComputation, Computation, ComputationError, DistributedComputation,
        DistributedExecutor, Stage, Task, TaskError, TaskGraph,
    },
    config::ConnectionConfig,
    database::{Column, ColumnType, ResultRecord, Row, SharedConnection, Value},
    pipeline::{run_computations, PipelineError},
    scheduler::{
        testing::FakeScheduler, JobSequence, Resources, SchedulerClient, WaitOptions,
    },
};
use parking_lot::Mutex;
use std::{path::Path, sync::Arc, time::Duration};
use tempfile::tempdir;

fn client(fake: &FakeScheduler, work_dir: &Path, sequence: &Arc<JobSequence>) -> SchedulerClient {
    SchedulerClient::new(
        Box::new(fake.clone()),
        Resources::default(),
        work_dir,
        sequence.clone(),
    )
    .with_wait_options(WaitOptions {
        poll_interval: Duration::ZERO,
        ..WaitOptions::default()
    })
}

/// one command per id, every record stores its position
struct Listing {
    name: &'static str,
    ids: Vec<&'static str>,
    value_type: ColumnType,
}

impl Listing {
    fn new(name: &'static str, ids: &[&'static str]) -> Self {
        Self {
            name,
            ids: ids.to_vec(),
            value_type: ColumnType::Integer,
        }
    }
}

impl Computation for Listing {
    fn name(&self) -> &str {
        self.name
    }

    fn result_columns(&self) -> Vec<Column> {
        vec![Column::new("value", self.value_type)]
    }
}

impl ClusterComputation for Listing {
    fn make_cmd_list(
        &mut self,
        _session: &SharedConnection,
    ) -> Result<(Vec<ResultRecord>, Vec<String>), ComputationError> {
        Ok(self
            .ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                (
                    ResultRecord::new(*id).with("value", index as i64),
                    format!("echo {id}"),
                )
            })
            .unzip())
    }
}

/// one command per record stored by another stage
struct FollowUp {
    source: &'static str,
}

impl Computation for FollowUp {
    fn name(&self) -> &str {
        "follow_up"
    }

    fn result_columns(&self) -> Vec<Column> {
        vec![Column::new("parent", ColumnType::Text)]
    }
}

impl ClusterComputation for FollowUp {
    fn make_cmd_list(
        &mut self,
        session: &SharedConnection,
    ) -> Result<(Vec<ResultRecord>, Vec<String>), ComputationError> {
        Ok(session
            .ids(self.source)?
            .into_iter()
            .map(|id| {
                (
                    ResultRecord::new(format!("{id}_next")).with("parent", id.clone()),
                    format!("next {id}"),
                )
            })
            .unzip())
    }
}

struct Broken;

impl Computation for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn result_columns(&self) -> Vec<Column> {
        vec![Column::new("value", ColumnType::Integer)]
    }
}

impl ClusterComputation for Broken {
    fn make_cmd_list(
        &mut self,
        _session: &SharedConnection,
    ) -> Result<(Vec<ResultRecord>, Vec<String>), ComputationError> {
        Err(ComputationError::precondition("input directory is gone"))
    }
}

struct Energies {
    fail: bool,
}

impl Computation for Energies {
    fn name(&self) -> &str {
        "energies"
    }

    fn result_columns(&self) -> Vec<Column> {
        vec![
            Column::new("energy", ColumnType::Real),
            Column::new("converged", ColumnType::Boolean),
        ]
    }
}

impl DistributedComputation for Energies {
    fn make_futures(&mut self, _session: &SharedConnection) -> Result<TaskGraph, ComputationError> {
        let fail = self.fail;

        Ok((1..=3)
            .map(|index| {
                Task::new(format!("mol_{index}"), move || {
                    if fail && index == 2 {
                        return Err(TaskError::failed("mol_2", "SCF did not converge"));
                    }

                    Ok(Row::from([
                        ("id".to_owned(), Value::from(format!("mol_{index}"))),
                        ("energy".to_owned(), Value::Real(-(index as f64))),
                    ]))
                })
                .then(|mut row| {
                    row.insert("converged".to_owned(), Value::Boolean(true));
                    Ok(row)
                })
            })
            .collect())
    }
}

/// logs every call of the stage protocol with the number of records stored at that point
struct Recording {
    calls: Arc<Mutex<Vec<String>>>,
    records: usize,
    fail: bool,
}

impl Recording {
    fn log(&self, call: &str, session: &SharedConnection) {
        let stored = session.records("recording").map(|records| records.len()).unwrap_or(0);
        self.calls.lock().push(format!("{call}:{stored}"));
    }
}

impl Computation for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    fn result_columns(&self) -> Vec<Column> {
        vec![Column::new("value", ColumnType::Integer)]
    }

    fn pre_execution(&mut self, session: &SharedConnection) -> Result<(), ComputationError> {
        self.log("pre", session);
        Ok(())
    }

    fn post_execution(&mut self, session: &SharedConnection) -> Result<(), ComputationError> {
        self.log("post", session);
        Ok(())
    }
}

impl ClusterComputation for Recording {
    fn make_cmd_list(
        &mut self,
        session: &SharedConnection,
    ) -> Result<(Vec<ResultRecord>, Vec<String>), ComputationError> {
        self.log("execute", session);

        if self.fail {
            return Err(ComputationError::precondition("no inputs"));
        }

        Ok((0..self.records)
            .map(|index| {
                (
                    ResultRecord::new(format!("run_{index}")).with("value", index as i64),
                    format!("echo {index}"),
                )
            })
            .unzip())
    }
}

#[test]
fn one_record_per_command() {
    let dir = tempdir().unwrap();
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());
    let session = SharedConnection::in_memory().unwrap();

    let mut stages = vec![Stage::cluster(
        Listing::new("single", &["only"]),
        client(&fake, dir.path(), &sequence),
    )];

    let report = run_computations(&mut stages, session.clone()).unwrap();

    assert_eq!(report.records(), 1);
    assert_eq!(fake.submitted().len(), 1);
    assert!(stages[0].successful());

    let records = session.records("single").unwrap();
    assert_eq!(records, [ResultRecord::new("only").with("value", 0i64)]);
}

#[test]
fn stages_write_to_their_own_tables() {
    let dir = tempdir().unwrap();
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());
    let session = SharedConnection::in_memory().unwrap();

    let mut stages = vec![
        Stage::cluster(
            Listing::new("first", &["a", "b"]),
            client(&fake, dir.path(), &sequence),
        ),
        Stage::cluster(
            Listing::new("second", &["c"]),
            client(&fake, dir.path(), &sequence),
        ),
    ];

    let report = run_computations(&mut stages, session.clone()).unwrap();

    assert_eq!(
        report.stages.iter().map(|stage| stage.records).collect::<Vec<_>>(),
        [2, 1]
    );
    assert_eq!(
        session.ids("first").unwrap().into_iter().collect::<Vec<_>>(),
        ["a", "b"]
    );
    assert_eq!(
        session.ids("second").unwrap().into_iter().collect::<Vec<_>>(),
        ["c"]
    );

    // both stages drew from the same sequence
    let scripts = fake.scripts();
    assert!(scripts[0].contains("-J batchflow_0"));
    assert!(scripts[1].contains("-J batchflow_1"));
}

#[test]
fn later_stages_see_committed_records() {
    let dir = tempdir().unwrap();
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());
    let session = SharedConnection::in_memory().unwrap();

    let mut stages = vec![
        Stage::cluster(
            Listing::new("molecules", &["water", "ethanol"]),
            client(&fake, dir.path(), &sequence),
        ),
        Stage::cluster(
            FollowUp {
                source: "molecules",
            },
            client(&fake, dir.path(), &sequence),
        ),
    ];

    run_computations(&mut stages, session.clone()).unwrap();

    let records = session.records("follow_up").unwrap();
    assert_eq!(
        records,
        [
            ResultRecord::new("ethanol_next").with("parent", "ethanol"),
            ResultRecord::new("water_next").with("parent", "water"),
        ]
    );
}

#[test]
fn failing_stage_keeps_earlier_results() {
    let dir = tempdir().unwrap();
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());
    let session = SharedConnection::in_memory().unwrap();

    let mut stages = vec![
        Stage::cluster(
            Listing::new("first", &["a"]),
            client(&fake, dir.path(), &sequence),
        ),
        Stage::cluster(Broken, client(&fake, dir.path(), &sequence)),
        Stage::cluster(
            Listing::new("never", &["z"]),
            client(&fake, dir.path(), &sequence),
        ),
    ];

    let error = run_computations(&mut stages, session.clone()).unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Stage { ref name, source: ComputationError::Precondition(_) } if name == "broken"
    ));
    assert_eq!(session.records("first").unwrap().len(), 1);
    assert!(!session.table_exists("never").unwrap());
    assert_eq!(
        stages.iter().map(Stage::successful).collect::<Vec<_>>(),
        [true, false, false]
    );
}

#[test]
fn distributed_stage_stores_computed_rows() {
    let executor = Arc::new(DistributedExecutor::new(2).unwrap());
    let session = SharedConnection::in_memory().unwrap();
    let mut stages = vec![Stage::distributed(Energies { fail: false }, executor)];

    let report = run_computations(&mut stages, session.clone()).unwrap();
    assert_eq!(report.records(), 3);

    let records = session.records("energies").unwrap();
    assert_eq!(
        records[1],
        ResultRecord::new("mol_2")
            .with("energy", -2.0)
            .with("converged", true)
    );
}

#[test]
fn failing_task_commits_nothing() {
    let executor = Arc::new(DistributedExecutor::new(2).unwrap());
    let session = SharedConnection::in_memory().unwrap();
    let mut stages = vec![Stage::distributed(Energies { fail: true }, executor)];

    let error = run_computations(&mut stages, session.clone()).unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Stage {
            source: ComputationError::Task(TaskError::Failed { .. }),
            ..
        }
    ));
    assert!(session.records("energies").unwrap().is_empty());
    assert!(!stages[0].successful());
}

#[test]
fn conflicting_declaration_aborts_before_submission() {
    let dir = tempdir().unwrap();
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());
    let session = SharedConnection::in_memory().unwrap();

    let mut conflicting = Listing::new("values", &["b"]);
    conflicting.value_type = ColumnType::Text;

    let mut stages = vec![
        Stage::cluster(
            Listing::new("values", &["a"]),
            client(&fake, dir.path(), &sequence),
        ),
        Stage::cluster(conflicting, client(&fake, dir.path(), &sequence)),
    ];

    assert!(run_computations(&mut stages, session.clone()).is_err());
    assert_eq!(fake.submitted().len(), 1);
    assert_eq!(
        session.ids("values").unwrap().into_iter().collect::<Vec<_>>(),
        ["a"]
    );
}

#[test]
fn owned_session_is_closed_after_the_run() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("results.db");
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());

    let mut stages = vec![Stage::cluster(
        Listing::new("single", &["only"]),
        client(&fake, dir.path(), &sequence),
    )];

    run_computations(
        &mut stages,
        ConnectionConfig::SQLite { path: path.clone() },
    )
    .unwrap();

    let reopened = SharedConnection::load(&ConnectionConfig::SQLite { path }).unwrap();
    assert_eq!(reopened.records("single").unwrap().len(), 1);
}

#[test]
fn hooks_surround_an_empty_execution() {
    let dir = tempdir().unwrap();
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());
    let session = SharedConnection::in_memory().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut stages = vec![Stage::cluster(
        Recording {
            calls: calls.clone(),
            records: 0,
            fail: false,
        },
        client(&fake, dir.path(), &sequence),
    )];

    let report = run_computations(&mut stages, session.clone()).unwrap();

    // nothing is stored before the post hook returned
    assert_eq!(*calls.lock(), ["pre:0", "execute:0", "post:0"]);
    assert_eq!(report.records(), 0);
    assert!(fake.scripts().is_empty());
    assert!(stages[0].successful());
}

#[test]
fn post_hook_is_skipped_after_failed_execution() {
    let dir = tempdir().unwrap();
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());
    let session = SharedConnection::in_memory().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut stages = vec![Stage::cluster(
        Recording {
            calls: calls.clone(),
            records: 1,
            fail: true,
        },
        client(&fake, dir.path(), &sequence),
    )];

    assert!(run_computations(&mut stages, session).is_err());
    assert_eq!(*calls.lock(), ["pre:0", "execute:0"]);
    assert!(!stages[0].successful());
}

#[test]
fn records_are_committed_after_the_hooks() {
    let dir = tempdir().unwrap();
    let fake = FakeScheduler::new();
    let sequence = Arc::new(JobSequence::new());
    let session = SharedConnection::in_memory().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut stages = vec![Stage::cluster(
        Recording {
            calls: calls.clone(),
            records: 2,
            fail: false,
        },
        client(&fake, dir.path(), &sequence),
    )];

    run_computations(&mut stages, session.clone()).unwrap();

    assert_eq!(*calls.lock(), ["pre:0", "execute:0", "post:0"]);
    assert_eq!(session.records("recording").unwrap().len(), 2);
    assert_eq!(fake.submitted().len(), 1);
}
