use crate::database::schema::is_identifier;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fs, io::Error, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    Read(#[from] Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Placeholder every program stage command has to contain
pub const INPUT_PLACEHOLDER: &str = "{input}";

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    // settings shared by all scheduler clients of this pipeline
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(alias = "db")]
    pub database: ConnectionConfig,

    // stages are executed in the order they are declared in
    pub stages: Vec<StageConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionConfig {
    SQLite {
        #[serde(default = "default_database_path")]
        path: PathBuf,
    },
    Memory,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_cpus_per_task")]
    pub cpus_per_task: u32,
    // passed as is to `--mem`, e.g., 2G or 500M
    #[serde(default = "default_memory_per_task")]
    pub memory_per_task: String,
    // base name, every submission appends a sequence number
    #[serde(default = "default_job_name")]
    pub job_name: String,
    // seconds between two queue checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    // seconds to wait for submitted jobs before giving up, waits forever if unset
    #[serde(default)]
    pub timeout: Option<u64>,
    // directory for submission scripts and arguments files, must be visible to the nodes
    #[serde(default = "get_tmp_dir")]
    pub work_dir: PathBuf,
    // seconds a single sbatch/squeue call may take
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default = "default_submit_command")]
    pub submit_command: String,
    #[serde(default = "default_status_command")]
    pub status_command: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    // result table, defaults to the stage name
    pub table: Option<String>,
    // command template, supports {input}, {stem} and {dir}
    pub command: String,
    pub input_extension: String,
    pub target_dir: PathBuf,
    #[serde(default = "default_skip_existing")]
    pub skip_existing: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpus_per_task: default_cpus_per_task(),
            memory_per_task: default_memory_per_task(),
            job_name: default_job_name(),
            poll_interval: default_poll_interval(),
            timeout: None,
            work_dir: get_tmp_dir(),
            command_timeout: default_command_timeout(),
            submit_command: default_submit_command(),
            status_command: default_status_command(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

impl StageConfig {
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(input: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// check the whole config and report every problem, returns true if an error was found
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.stages.is_empty() {
            error!("No stage was defined, nothing to run");
            contains_error = true;
        }

        let scheduler = &self.scheduler;

        if scheduler.cpus_per_task == 0 {
            error!("scheduler.cpus_per_task must be at least 1");
            contains_error = true;
        }

        if scheduler.memory_per_task.trim().is_empty() {
            error!("scheduler.memory_per_task must not be empty");
            contains_error = true;
        }

        if scheduler.job_name.is_empty() || scheduler.job_name.contains(char::is_whitespace) {
            error!(
                "scheduler.job_name '{}' must be non-empty and free of whitespace",
                scheduler.job_name
            );
            contains_error = true;
        }

        if scheduler.poll_interval == 0 {
            warn!("scheduler.poll_interval is 0, the queue will be polled without pause");
        }

        if scheduler.command_timeout == 0 {
            error!("scheduler.command_timeout cannot be 0");
            contains_error = true;
        }

        if !scheduler.work_dir.is_dir() {
            error!(
                "scheduler.work_dir {} is not a directory",
                scheduler.work_dir.to_string_lossy()
            );
            contains_error = true;
        }

        let mut tables = BTreeMap::new();

        for (index, stage) in self.stages.iter().enumerate() {
            let name = &stage.name;

            if !is_identifier(stage.table_name()) {
                error!(
                    "stages[{index}] ({name}) table '{}' must only contain letters, digits and '_'",
                    stage.table_name()
                );
                contains_error = true;
            }

            if !stage.command.contains(INPUT_PLACEHOLDER) {
                error!("stages[{index}] ({name}).command must contain {INPUT_PLACEHOLDER}");
                contains_error = true;
            }

            if stage.input_extension.is_empty() {
                error!("stages[{index}] ({name}).input_extension must not be empty");
                contains_error = true;
            }

            if !stage.target_dir.is_dir() {
                error!(
                    "stages[{index}] ({name}).target_dir {} is not a directory",
                    stage.target_dir.to_string_lossy()
                );
                contains_error = true;
            }

            tables
                .entry(stage.table_name().to_owned())
                .or_insert_with(Vec::new)
                .push(name.clone());
        }

        for (table, stages) in tables.iter().filter(|(_, stages)| stages.len() > 1) {
            warn!(
                "Stages {} share the table {table}, their columns must be compatible",
                stages.iter().join(", ")
            );
        }

        contains_error
    }
}

/// primitve way to retrieve the tmp dir from the environment with default to /tmp
pub fn get_tmp_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
}

fn default_database_path() -> PathBuf {
    PathBuf::from("batchflow.db")
}

fn default_cpus_per_task() -> u32 {
    1
}

fn default_memory_per_task() -> String {
    "2G".to_owned()
}

fn default_job_name() -> String {
    "batchflow".to_owned()
}

fn default_poll_interval() -> u64 {
    1
}

fn default_command_timeout() -> u64 {
    60
}

fn default_submit_command() -> String {
    "sbatch".to_owned()
}

fn default_status_command() -> String {
    "squeue".to_owned()
}

fn default_skip_existing() -> bool {
    true
}
