//! Adapter for the SLURM command line tools.
//!
//! All knowledge about the textual output of `sbatch` and `squeue` lives in this module.
//! Text contract (version 1):
//!
//! * `sbatch <script>` prints the job id as its last whitespace delimited token on stdout,
//!   e.g., `Submitted batch job 123`. A `;cluster` suffix (`--parsable`) is ignored. The id
//!   must consist of ASCII digits only, anything else is treated as a failed submission.
//! * `squeue -j <id>` prints a header line followed by one line per queued or running part
//!   of the job. At most one non-empty line means the job left the queue. A non-zero exit
//!   complaining about an invalid job id means the controller already forgot the job, which
//!   is treated as finished as well.
//! * The `ST` column distinguishes pending (`PD`) from every other (running) state.

use super::{JobId, JobState, SchedulerAdapter, SchedulerError};
use crate::config::SchedulerConfig;
use std::{
    ffi::OsStr,
    io::{self, Read},
    path::Path,
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

pub const TEXT_CONTRACT_VERSION: u32 = 1;

/// extract the job id from the output of `sbatch`
pub fn parse_job_id(stdout: &str) -> Option<JobId> {
    let token = stdout.split_whitespace().last()?;
    let id = token.split(';').next().unwrap_or(token);

    if !id.is_empty() && id.bytes().all(|byte| byte.is_ascii_digit()) {
        Some(JobId::from(id))
    } else {
        None
    }
}

/// interpret the output of `squeue -j <id>`
pub fn parse_queue_state(stdout: &str) -> JobState {
    let mut lines = stdout.lines().filter(|line| !line.trim().is_empty());

    let header = match lines.next() {
        Some(header) => header,
        None => return JobState::Finished,
    };
    let rows = lines.collect::<Vec<_>>();

    if rows.is_empty() {
        return JobState::Finished;
    }

    let state_column = match header.split_whitespace().position(|field| field == "ST") {
        Some(column) => column,
        None => return JobState::Running,
    };

    if rows
        .iter()
        .all(|row| row.split_whitespace().nth(state_column) == Some("PD"))
    {
        JobState::Queued
    } else {
        JobState::Running
    }
}

/// check if `squeue` complained about a job id it doesn't know (anymore)
pub fn is_unknown_job(stderr: &str) -> bool {
    stderr.to_lowercase().contains("invalid job id")
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// drain a pipe on its own thread, a full pipe would otherwise block the child forever
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut output = String::new();

        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut output)?;
        }

        Ok(output)
    })
}

fn join_output(reader: thread::JoinHandle<io::Result<String>>) -> io::Result<String> {
    reader
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "output reader panicked")))
}

/// run a scheduler command and collect its output, the child is killed after `timeout`
pub fn run_command<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
) -> Result<CommandOutput, SchedulerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    match child.wait_timeout(timeout)? {
        Some(status) => {
            let stdout = join_output(stdout)?;
            let stderr = join_output(stderr)?;

            trace!(program = program, stdout = %stdout, stderr = %stderr, "Command output");

            Ok(CommandOutput {
                success: status.success(),
                code: status.code(),
                stdout,
                stderr,
            })
        }
        None => {
            // child hasn't exited yet
            if let Err(error) = child.kill() {
                warn!(error = ?error, program = program, "Failed to kill timed out command");
            }
            child.wait()?;

            Err(SchedulerError::CommandTimeout {
                command: program.to_owned(),
                timeout,
            })
        }
    }
}

/// Scheduler adapter shelling out to `sbatch` and `squeue`
#[derive(Debug, Clone)]
pub struct SlurmAdapter {
    submit_command: String,
    status_command: String,
    timeout: Duration,
}

impl Default for SlurmAdapter {
    fn default() -> Self {
        Self::load(&SchedulerConfig::default())
    }
}

impl SlurmAdapter {
    pub fn load(config: &SchedulerConfig) -> Self {
        Self {
            submit_command: config.submit_command.clone(),
            status_command: config.status_command.clone(),
            timeout: config.command_timeout(),
        }
    }
}

impl SchedulerAdapter for SlurmAdapter {
    fn submit(&self, script: &Path) -> Result<JobId, SchedulerError> {
        let output = run_command(&self.submit_command, [script.as_os_str()], self.timeout)?;

        if !output.success {
            return Err(SchedulerError::SubmissionFailed {
                code: output.code,
                stderr: output.stderr,
            });
        }

        debug!(stdout = output.stdout.trim(), "Submitted script");

        parse_job_id(&output.stdout).ok_or(SchedulerError::MissingJobId {
            stdout: output.stdout,
        })
    }

    fn status(&self, job: &JobId) -> Result<JobState, SchedulerError> {
        let output = run_command(
            &self.status_command,
            [OsStr::new("-j"), OsStr::new(job.as_str())],
            self.timeout,
        )?;

        if !output.success {
            if is_unknown_job(&output.stderr) {
                debug!(job = %job, "Job is no longer known to the controller");

                return Ok(JobState::Finished);
            }

            return Err(SchedulerError::PollFailed {
                job: job.clone(),
                code: output.code,
                stderr: output.stderr,
            });
        }

        Ok(parse_queue_state(&output.stdout))
    }
}
