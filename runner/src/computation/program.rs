use super::{ClusterComputation, Computation, ComputationError};
use crate::{
    config::{StageConfig, INPUT_PLACEHOLDER},
    database::{Column, ColumnType, ResultRecord, SharedConnection},
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Runs an external program once per input file of a directory
///
/// The command template may use `{input}` (absolute path of the input file), `{stem}` (file
/// name without the extension) and `{dir}` (directory of the input file). Each input becomes
/// one record with the stem as its identifier.
#[derive(Debug, Clone)]
pub struct ProgramStage {
    name: String,
    table: String,
    command: String,
    input_extension: String,
    target_dir: PathBuf,
    skip_existing: bool,
}

impl ProgramStage {
    pub fn load(config: &StageConfig) -> Self {
        Self {
            name: config.name.clone(),
            table: config.table_name().to_owned(),
            command: config.command.clone(),
            input_extension: config.input_extension.trim_start_matches('.').to_owned(),
            target_dir: config.target_dir.clone(),
            skip_existing: config.skip_existing,
        }
    }

    fn check_preconditions(&self) -> Result<(), ComputationError> {
        if !self.command.contains(INPUT_PLACEHOLDER) {
            return Err(ComputationError::precondition(format!(
                "command of {} does not contain {INPUT_PLACEHOLDER}",
                self.name
            )));
        }

        if self.input_extension.is_empty() {
            return Err(ComputationError::precondition(format!(
                "input extension of {} is empty",
                self.name
            )));
        }

        if !self.target_dir.is_dir() {
            return Err(ComputationError::precondition(format!(
                "{} is not a directory",
                self.target_dir.to_string_lossy()
            )));
        }

        Ok(())
    }

    /// file name without the input extension, `None` for files of other types
    pub fn stem(&self, input: &Path) -> Option<String> {
        let name = input.file_name()?.to_str()?;
        let stem = name.strip_suffix(&self.input_extension)?.strip_suffix('.')?;

        (!stem.is_empty()).then(|| stem.to_owned())
    }

    /// input files in the target directory, sorted by name
    pub fn inputs(&self) -> Result<Vec<PathBuf>, ComputationError> {
        let mut inputs = fs::read_dir(&self.target_dir)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|path| path.is_file() && self.stem(path).is_some())
            .collect::<Vec<_>>();
        inputs.sort();

        Ok(inputs)
    }

    /// the command for a single input file
    pub fn render(&self, input: &Path) -> Result<String, ComputationError> {
        let stem = self.stem(input).unwrap_or_default();
        let input = input.canonicalize()?;
        let dir = input
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(self
            .command
            .replace(INPUT_PLACEHOLDER, &input.to_string_lossy())
            .replace("{stem}", &stem)
            .replace("{dir}", &dir))
    }
}

impl Computation for ProgramStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn table_name(&self) -> &str {
        &self.table
    }

    fn result_columns(&self) -> Vec<Column> {
        vec![
            Column::new("input", ColumnType::Text),
            Column::new("command", ColumnType::Text),
        ]
    }

    fn pre_execution(&mut self, _session: &SharedConnection) -> Result<(), ComputationError> {
        self.check_preconditions()
    }
}

impl ClusterComputation for ProgramStage {
    fn make_cmd_list(
        &mut self,
        session: &SharedConnection,
    ) -> Result<(Vec<ResultRecord>, Vec<String>), ComputationError> {
        self.check_preconditions()?;

        let existing = if self.skip_existing {
            session.ids(&self.table)?
        } else {
            Default::default()
        };

        let mut records = Vec::new();
        let mut commands = Vec::new();
        let mut skipped = 0;

        for input in self.inputs()? {
            let id = match self.stem(&input) {
                Some(stem) => stem,
                None => continue,
            };

            if existing.contains(&id) {
                skipped += 1;
                continue;
            }

            let command = self.render(&input)?;
            debug!(id = %id, command = %command, "Created command");

            records.push(
                ResultRecord::new(id)
                    .with("input", input.to_string_lossy().into_owned())
                    .with("command", command.clone()),
            );
            commands.push(command);
        }

        if skipped > 0 {
            info!(name = %self.name, skipped, "Skipped inputs with stored results");
        }

        Ok((records, commands))
    }
}
