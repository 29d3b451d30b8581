pub mod script;
pub mod sequence;
pub mod slurm;
pub mod testing;

pub use sequence::JobSequence;
pub use slurm::SlurmAdapter;

use crate::config::SchedulerConfig;
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};
use script::{write_arguments, ScriptParameters, SLURM_SCRIPT};
use std::{
    fmt::{self, Debug},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to interact with the scheduler: {0}")]
    Io(#[from] io::Error),
    #[error("Submission was rejected (exit code {code:?}): {stderr}")]
    SubmissionFailed { code: Option<i32>, stderr: String },
    #[error("No job id found in submission output '{stdout}'")]
    MissingJobId { stdout: String },
    #[error("Failed to query state of job {job} (exit code {code:?}): {stderr}")]
    PollFailed {
        job: JobId,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Scheduler command {command} did not finish within {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("Jobs {} did not finish in time", .pending.iter().join(", "))]
    Timeout { pending: Vec<JobId> },
    #[error("Waiting for jobs was cancelled")]
    Cancelled,
    #[error("Command {index} spans multiple lines and can't be used as an array task")]
    MultilineCommand { index: usize },
}

/// Identifier assigned by the scheduler to a submission
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a job as far as the queue can tell
/// failed, cancelled and evicted jobs are all reported as `Finished`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
}

/// Minimal interface a batch system has to provide
pub trait SchedulerAdapter: Debug + Send {
    /// submit a rendered script and return the id of the created job
    fn submit(&self, script: &Path) -> Result<JobId, SchedulerError>;

    /// query the current state of a job
    fn status(&self, job: &JobId) -> Result<JobState, SchedulerError>;
}

/// A submission tracked until it leaves the queue
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub tasks: usize,
    pub created: SystemTime,
    pub args_file: PathBuf,
}

/// Cooperative cancellation for `SchedulerClient::wait`
/// Clones share the same flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock() = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// sleep for `duration` or until cancelled, returns true if cancelled
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = flag.lock();

        while !*cancelled {
            if condvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }

        *cancelled
    }
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    // maximum time spent in a single wait, unbounded if unset
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl WaitOptions {
    pub fn load(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            cancellation: CancellationToken::new(),
        }
    }
}

/// Resources requested for every task of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    pub cpus_per_task: u32,
    pub memory_per_task: String,
    pub job_name: String,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus_per_task: 1,
            memory_per_task: "2G".to_owned(),
            job_name: "batchflow".to_owned(),
        }
    }
}

/// Submits lists of commands as array jobs and waits for them to leave the queue
/// Not meant to be shared between threads, all state changes go through `&mut self`
#[derive(Debug)]
pub struct SchedulerClient {
    adapter: Box<dyn SchedulerAdapter>,
    resources: Resources,
    work_dir: PathBuf,
    sequence: Arc<JobSequence>,
    options: WaitOptions,
    jobs: Vec<Job>,
}

impl SchedulerClient {
    pub fn new(
        adapter: Box<dyn SchedulerAdapter>,
        resources: Resources,
        work_dir: impl Into<PathBuf>,
        sequence: Arc<JobSequence>,
    ) -> Self {
        Self {
            adapter,
            resources,
            work_dir: work_dir.into(),
            sequence,
            options: WaitOptions::default(),
            jobs: Vec::new(),
        }
    }

    /// create a client talking to SLURM as described by the config
    pub fn load(config: &SchedulerConfig, sequence: Arc<JobSequence>) -> Self {
        Self::new(
            Box::new(SlurmAdapter::load(config)),
            Resources {
                cpus_per_task: config.cpus_per_task,
                memory_per_task: config.memory_per_task.clone(),
                job_name: config.job_name.clone(),
            },
            config.work_dir.clone(),
            sequence,
        )
        .with_wait_options(WaitOptions::load(config))
    }

    /// options used by `wait_default`, e.g., by cluster stages
    pub fn with_wait_options(mut self, options: WaitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn wait_options(&self) -> &WaitOptions {
        &self.options
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn tracked_jobs(&self) -> Vec<JobId> {
        self.jobs.iter().map(|job| job.id.clone()).collect()
    }

    /// submit all commands as a single array job, task i runs command i
    /// returns `None` without contacting the scheduler if there is nothing to run
    #[instrument(skip(self, commands), fields(tasks = commands.len()), level = "info")]
    pub fn submit<S: AsRef<str>>(&mut self, commands: &[S]) -> Result<Option<JobId>, SchedulerError> {
        if commands.is_empty() {
            warn!("No commands to submit, skipping submission");

            return Ok(None);
        }

        if let Some(index) = commands
            .iter()
            .position(|command| command.as_ref().contains(|c: char| c == '\n' || c == '\r'))
        {
            return Err(SchedulerError::MultilineCommand { index });
        }

        fs::create_dir_all(&self.work_dir)?;
        // array tasks resolve the arguments file on the compute nodes
        let work_dir = fs::canonicalize(&self.work_dir)?;
        let name = self.sequence.job_name(&self.resources.job_name);
        let args_file = PendingArguments::new(work_dir.join(format!("{name}.args")));

        write_arguments(args_file.path(), commands)?;

        let script = ScriptParameters {
            n_tasks: commands.len(),
            cpus_per_task: self.resources.cpus_per_task,
            memory_per_task: &self.resources.memory_per_task,
            job_name: &name,
            args_file: args_file.path(),
        }
        .render(SLURM_SCRIPT);

        // the scheduler copies the script on submission, it is removed once dropped
        let mut script_file = tempfile::Builder::new()
            .prefix(&name)
            .suffix(".sbatch")
            .tempfile_in(&work_dir)?;
        script_file.write_all(script.as_bytes())?;
        script_file.flush()?;

        let id = self.adapter.submit(script_file.path())?;

        info!(job = %id, name = %name, tasks = commands.len(), "Submitted array job");

        self.jobs.push(Job {
            id: id.clone(),
            name,
            tasks: commands.len(),
            created: SystemTime::now(),
            args_file: args_file.keep(),
        });

        Ok(Some(id))
    }

    /// block until all tracked jobs left the queue, using the client's wait options
    pub fn wait_default(&mut self) -> Result<(), SchedulerError> {
        let options = self.options.clone();

        self.wait(&options)
    }

    /// block until all tracked jobs left the queue
    /// jobs are checked every `poll_interval`, a timeout or cancellation keeps the
    /// remaining jobs tracked
    #[instrument(skip(self, options), fields(jobs = self.jobs.len()), level = "info")]
    pub fn wait(&mut self, options: &WaitOptions) -> Result<(), SchedulerError> {
        if self.jobs.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        info!(
            "Waiting for jobs {} to finish",
            self.jobs.iter().map(|job| &job.id).join(", ")
        );

        loop {
            if options.cancellation.sleep(options.poll_interval) {
                warn!("Waiting for jobs was cancelled");

                return Err(SchedulerError::Cancelled);
            }

            let mut pending = Vec::with_capacity(self.jobs.len());
            let mut jobs = std::mem::take(&mut self.jobs).into_iter();

            while let Some(job) = jobs.next() {
                match self.adapter.status(&job.id) {
                    Ok(JobState::Finished) => {
                        info!(
                            job = %job.id,
                            elapsed = ?job.created.elapsed().unwrap_or_default(),
                            "Job left the queue"
                        );
                        remove_arguments(&job.args_file);
                    }
                    Ok(state) => {
                        debug!(job = %job.id, state = ?state, "Job still queued");
                        pending.push(job);
                    }
                    Err(error) => {
                        // keep the job tracked, the caller decides what happens next
                        pending.push(job);
                        pending.extend(jobs);
                        self.jobs = pending;

                        return Err(error);
                    }
                }
            }

            self.jobs = pending;

            if self.jobs.is_empty() {
                info!(elapsed = ?start.elapsed(), "All jobs finished");

                return Ok(());
            }

            if let Some(timeout) = options.timeout {
                if start.elapsed() >= timeout {
                    return Err(SchedulerError::Timeout {
                        pending: self.tracked_jobs(),
                    });
                }
            }
        }
    }
}

/// Arguments file of a submission in progress, removed on drop unless a tracked job takes it over
struct PendingArguments {
    path: PathBuf,
    kept: bool,
}

impl PendingArguments {
    fn new(path: PathBuf) -> Self {
        Self { path, kept: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) -> PathBuf {
        self.kept = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PendingArguments {
    fn drop(&mut self) {
        if !self.kept && self.path.exists() {
            remove_arguments(&self.path);
        }
    }
}

fn remove_arguments(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        warn!(error = ?error, path = ?path, "Failed to remove arguments file");
    }
}
