//! In-memory scheduler for tests and dry runs.
//!
//! `FakeScheduler` speaks the same text contract as SLURM: submissions are answered with a
//! configurable `sbatch` style line and job states are produced as `squeue` output, both
//! going through the parsers of the SLURM adapter.

use super::{
    slurm::{parse_job_id, parse_queue_state},
    JobId, JobState, SchedulerAdapter, SchedulerError,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, fs, path::Path, sync::Arc};

const QUEUE_HEADER: &str = "JOBID PARTITION NAME USER ST TIME NODES NODELIST(REASON)";

#[derive(Debug, Default)]
struct FakeJob {
    polls: usize,
    // number of the poll reporting the job as gone, never if unset
    finish_after: Option<usize>,
}

#[derive(Debug)]
struct FakeState {
    submit_output: Option<String>,
    finish_after: Option<usize>,
    fail_polls: bool,
    next_id: u64,
    scripts: Vec<String>,
    jobs: BTreeMap<JobId, FakeJob>,
}

/// Scheduler double, clones share their state so tests can inspect it after handing
/// a clone to a client
#[derive(Debug, Clone)]
pub struct FakeScheduler {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeScheduler {
    /// jobs get increasing ids starting at 1 and leave the queue on their first poll
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                submit_output: None,
                finish_after: Some(1),
                fail_polls: false,
                next_id: 1,
                scripts: Vec::new(),
                jobs: BTreeMap::new(),
            })),
        }
    }

    /// answer every submission with this `sbatch` output
    pub fn with_submit_output(self, output: &str) -> Self {
        self.state.lock().submit_output = Some(output.to_owned());
        self
    }

    /// jobs submitted from now on are reported as finished on their n-th poll
    pub fn finish_after(self, polls: usize) -> Self {
        self.state.lock().finish_after = Some(polls.max(1));
        self
    }

    /// jobs submitted from now on never leave the queue
    pub fn never_finish(self) -> Self {
        self.state.lock().finish_after = None;
        self
    }

    /// every status query fails as if `squeue` could not reach the controller
    pub fn fail_polls(self) -> Self {
        self.state.lock().fail_polls = true;
        self
    }

    /// content of all submitted scripts in submission order
    pub fn scripts(&self) -> Vec<String> {
        self.state.lock().scripts.clone()
    }

    /// number of status queries for a job
    pub fn polls(&self, job: &JobId) -> usize {
        self.state
            .lock()
            .jobs
            .get(job)
            .map(|job| job.polls)
            .unwrap_or_default()
    }

    pub fn submitted(&self) -> Vec<JobId> {
        self.state.lock().jobs.keys().cloned().collect()
    }
}

impl SchedulerAdapter for FakeScheduler {
    fn submit(&self, script: &Path) -> Result<JobId, SchedulerError> {
        let content = fs::read_to_string(script)?;
        let mut state = self.state.lock();

        let output = match state.submit_output {
            Some(ref output) => output.clone(),
            None => format!("Submitted batch job {}\n", state.next_id),
        };
        state.next_id += 1;
        state.scripts.push(content);

        let id = parse_job_id(&output).ok_or(SchedulerError::MissingJobId { stdout: output })?;
        let finish_after = state.finish_after;
        state.jobs.insert(
            id.clone(),
            FakeJob {
                polls: 0,
                finish_after,
            },
        );

        Ok(id)
    }

    fn status(&self, job: &JobId) -> Result<JobState, SchedulerError> {
        let mut state = self.state.lock();

        if state.fail_polls {
            return Err(SchedulerError::PollFailed {
                job: job.clone(),
                code: Some(1),
                stderr: "slurm_load_jobs error: Unable to contact slurm controller".to_owned(),
            });
        }

        let output = match state.jobs.get_mut(job) {
            Some(fake) => {
                fake.polls += 1;

                match fake.finish_after {
                    Some(limit) if fake.polls >= limit => format!("{QUEUE_HEADER}\n"),
                    _ => format!("{QUEUE_HEADER}\n{job} debug fake user R 0:01 1 node01\n"),
                }
            }
            // unknown jobs are long gone
            None => String::new(),
        };

        Ok(parse_queue_state(&output))
    }
}
