use batchflow::{
    computation::{ProgramStage, Stage},
    config::StageConfig,
    database::SharedConnection,
    pipeline::run_computations,
    scheduler::{testing::FakeScheduler, JobSequence, Resources, SchedulerClient, WaitOptions},
};
use std::{fs, path::Path, sync::Arc, time::Duration};
use tempfile::tempdir;

fn stage_config(target_dir: &Path) -> StageConfig {
    StageConfig {
        name: "orca".into(),
        table: Some("orca_runs".into()),
        command: "orca {input} > {dir}/{stem}.out".into(),
        input_extension: "inp".into(),
        target_dir: target_dir.to_path_buf(),
        skip_existing: true,
    }
}

fn program_stage(config: &StageConfig, fake: &FakeScheduler, work_dir: &Path) -> Stage {
    let client = SchedulerClient::new(
        Box::new(fake.clone()),
        Resources::default(),
        work_dir,
        Arc::new(JobSequence::new()),
    )
    .with_wait_options(WaitOptions {
        poll_interval: Duration::ZERO,
        ..WaitOptions::default()
    });

    Stage::cluster(ProgramStage::load(config), client)
}

#[test]
fn inputs_already_stored_are_skipped() {
    let inputs = tempdir().unwrap();
    let work_dir = tempdir().unwrap();
    for name in ["water.inp", "ethanol.inp"] {
        fs::write(inputs.path().join(name), "! B3LYP def2-SVP").unwrap();
    }

    let config = stage_config(inputs.path());
    let fake = FakeScheduler::new();
    let session = SharedConnection::in_memory().unwrap();

    let mut stages = vec![program_stage(&config, &fake, work_dir.path())];
    let report = run_computations(&mut stages, session.clone()).unwrap();
    assert_eq!(report.records(), 2);
    assert_eq!(report.stages[0].table, "orca_runs");

    // one new input, the second run only submits that one
    fs::write(inputs.path().join("benzene.inp"), "! B3LYP def2-SVP").unwrap();
    let mut stages = vec![program_stage(&config, &fake, work_dir.path())];
    let report = run_computations(&mut stages, session.clone()).unwrap();
    assert_eq!(report.records(), 1);

    let scripts = fake.scripts();
    assert_eq!(scripts.len(), 2);
    assert!(scripts[1].contains("--array=1-1"));

    let ids = session.ids("orca_runs").unwrap();
    assert_eq!(
        ids.into_iter().collect::<Vec<_>>(),
        ["benzene", "ethanol", "water"]
    );
}

#[test]
fn nothing_to_do_skips_the_scheduler() {
    let inputs = tempdir().unwrap();
    let work_dir = tempdir().unwrap();
    fs::write(inputs.path().join("notes.txt"), "").unwrap();

    let fake = FakeScheduler::new();
    let session = SharedConnection::in_memory().unwrap();
    let mut stages = vec![program_stage(&stage_config(inputs.path()), &fake, work_dir.path())];

    let report = run_computations(&mut stages, session).unwrap();

    assert_eq!(report.records(), 0);
    assert!(fake.scripts().is_empty());
    assert!(stages[0].successful());
}

#[test]
fn arguments_file_holds_rendered_commands() {
    let inputs = tempdir().unwrap();
    let work_dir = tempdir().unwrap();
    fs::write(inputs.path().join("water.inp"), "").unwrap();

    // keep the job queued so the arguments file is still around
    let fake = FakeScheduler::new().never_finish();
    let config = stage_config(inputs.path());
    let session = SharedConnection::in_memory().unwrap();

    let mut client = SchedulerClient::new(
        Box::new(fake.clone()),
        Resources::default(),
        work_dir.path(),
        Arc::new(JobSequence::new()),
    );
    let mut program = ProgramStage::load(&config);
    let (_, commands) =
        batchflow::ClusterComputation::make_cmd_list(&mut program, &session).unwrap();
    client.submit(&commands).unwrap();

    let args_file = &client.jobs()[0].args_file;
    let root = inputs.path().canonicalize().unwrap();
    let root = root.to_string_lossy();
    assert_eq!(
        fs::read_to_string(args_file).unwrap(),
        format!("orca {root}/water.inp > {root}/water.out\n")
    );
    assert!(fake.scripts()[0].contains(&args_file.to_string_lossy().into_owned()));
}

