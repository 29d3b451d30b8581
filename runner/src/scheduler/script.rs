use std::{
    fs,
    io::{self, Write},
    path::Path,
};

/// Batch script submitted for every set of commands, `$field$` markers are replaced literally
pub const SLURM_SCRIPT: &str = r#"#!/bin/bash
#SBATCH --array=1-$n_tasks$
#SBATCH --mem=$memory_per_task$
#SBATCH --cpus-per-task=$cpus_per_task$
#SBATCH --ntasks=1
#SBATCH --nodes=1
#SBATCH -J $job_name$
#SBATCH --output=/dev/null

args_file="$args_file$"
# get the i-th line of the arguments file
run_command=$(sed -n "${SLURM_ARRAY_TASK_ID}p" "$args_file")

eval "$run_command"
"#;

/// Parameters of a single submission script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptParameters<'a> {
    pub n_tasks: usize,
    pub cpus_per_task: u32,
    pub memory_per_task: &'a str,
    pub job_name: &'a str,
    pub args_file: &'a Path,
}

impl ScriptParameters<'_> {
    /// render the template, equal parameters always render to equal scripts
    pub fn render(&self, template: &str) -> String {
        template
            .replace("$n_tasks$", &self.n_tasks.to_string())
            .replace("$cpus_per_task$", &self.cpus_per_task.to_string())
            .replace("$memory_per_task$", self.memory_per_task)
            .replace("$job_name$", self.job_name)
            .replace("$args_file$", &self.args_file.to_string_lossy())
    }
}

/// write the arguments file, line i holds the command of array task i
pub fn write_arguments<S: AsRef<str>>(path: &Path, commands: &[S]) -> io::Result<()> {
    let mut file = io::BufWriter::new(fs::File::create(path)?);

    for command in commands {
        writeln!(file, "{}", command.as_ref())?;
    }

    file.flush()
}
