use super::{
    schema::{is_identifier, SchemaRegistry},
    ColumnType, ConnectionError, ResultRecord, SchemaError, TableSchema,
    Value, ID_COLUMN,
};
use crate::config::ConnectionConfig;
use itertools::Itertools;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{
    params, params_from_iter,
    types::{ToSqlOutput, ValueRef},
    Connection, ToSql,
};
use std::{collections::BTreeSet, fmt::Debug, sync::Arc};
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
/// Cloning hands out another handle to the same session
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
    registry: SchemaRegistry,
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Boolean(value) => ToSqlOutput::from(*value),
            Value::Integer(value) => ToSqlOutput::from(*value),
            Value::Real(value) => ToSqlOutput::from(*value),
            Value::Text(value) => ToSqlOutput::from(value.as_str()),
        })
    }
}

/// read a stored value back, using the declared column type to restore booleans
fn read_value(value: ValueRef<'_>, kind: Option<ColumnType>) -> Value {
    match (value, kind) {
        (ValueRef::Null, _) => Value::Null,
        (ValueRef::Integer(value), Some(ColumnType::Boolean)) => Value::Boolean(value != 0),
        (ValueRef::Integer(value), Some(ColumnType::Real)) => Value::Real(value as f64),
        (ValueRef::Integer(value), _) => Value::Integer(value),
        (ValueRef::Real(value), _) => Value::Real(value),
        (ValueRef::Text(text), _) | (ValueRef::Blob(text), _) => {
            Value::Text(String::from_utf8_lossy(text).into_owned())
        }
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(config)?))
    }

    /// open a private in-memory session, mostly useful for tests and dry runs
    pub fn in_memory() -> Result<Self, ConnectionError> {
        Self::load(&ConnectionConfig::Memory)
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        match Arc::try_unwrap(self.0) {
            Ok(inner) => inner.into_inner().close(),
            Err(shared) => Err(ConnectionError::StillShared(
                Arc::strong_count(&shared) - 1,
            )),
        }
    }

    /// register a table declaration, creating or extending the table if required
    pub fn register(&self, schema: &TableSchema) -> Result<TableSchema, ConnectionError> {
        self.lock().register(schema)
    }

    /// store all records in a single transaction, either all or none are committed
    pub fn store_iter<I: IntoIterator<Item = ResultRecord>>(
        &self,
        table: &str,
        records: I,
    ) -> Result<usize, ConnectionError> {
        self.lock().store_iter(table, records)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, ConnectionError> {
        self.lock().table_exists(table)
    }

    /// all identifiers stored in a table, empty if the table doesn't exist yet
    pub fn ids(&self, table: &str) -> Result<BTreeSet<String>, ConnectionError> {
        self.lock().ids(table)
    }

    /// all records stored in a table ordered by identifier
    pub fn records(&self, table: &str) -> Result<Vec<ResultRecord>, ConnectionError> {
        self.lock().records(table)
    }
}

impl InnerConnection {
    pub fn load(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let connection = match config {
            ConnectionConfig::SQLite { path } => {
                info!(path = ?path, "Opening SQLite database");

                Connection::open(path)?
            }
            ConnectionConfig::Memory => Connection::open_in_memory()?,
        };

        Ok(Self {
            connection,
            registry: SchemaRegistry::new(),
        })
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection, giving up");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    /// declared column types of an existing table, `None` if the table is absent
    fn existing_columns(
        &self,
        table: &str,
    ) -> Result<Option<Vec<(String, String)>>, ConnectionError> {
        if !is_identifier(table) {
            return Err(SchemaError::InvalidIdentifier(table.to_owned()).into());
        }

        let columns = self
            .connection
            .prepare(&format!("pragma table_info(\"{table}\")"))?
            .query_map([], |row| Ok((row.get(1)?, row.get(2)?)))?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<(String, String)>, ConnectionError>(init)
            })?;

        Ok(if columns.is_empty() {
            None
        } else {
            Some(columns)
        })
    }

    #[instrument(skip(self, schema), fields(table = schema.table()), level = "debug")]
    pub fn register(&mut self, schema: &TableSchema) -> Result<TableSchema, ConnectionError> {
        let table = schema.table();

        // validate against the stored table before touching the registry
        let existing = self.existing_columns(table)?;
        let mut missing = Vec::new();

        if let Some(ref columns) = existing {
            if !columns
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case(ID_COLUMN))
            {
                return Err(SchemaError::ReservedColumn {
                    table: table.to_owned(),
                    column: ID_COLUMN.to_owned(),
                }
                .into());
            }

            for column in schema.columns() {
                match columns
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&column.name))
                {
                    Some((_, declared)) => {
                        if ColumnType::from_sql_type(declared) != Some(column.kind) {
                            return Err(SchemaError::ConflictingColumn {
                                table: table.to_owned(),
                                column: column.name.clone(),
                                declared: column.kind.to_string(),
                                existing: declared.clone(),
                            }
                            .into());
                        }
                    }
                    None => missing.push(column.clone()),
                }
            }
        }

        // the registry only learns about columns the table actually has
        let mut registry = self.registry.clone();
        let merged = registry.register(schema)?;

        match existing {
            None => {
                let definition = std::iter::once(format!("{ID_COLUMN} text primary key not null"))
                    .chain(
                        merged
                            .columns()
                            .iter()
                            .map(|column| format!("\"{}\" {}", column.name, column.kind.sql_type())),
                    )
                    .join(", ");

                self.connection.execute(
                    &format!("create table if not exists \"{table}\" ({definition})"),
                    [],
                )?;

                info!(table = table, columns = merged.columns().len(), "Created result table");
            }
            Some(_) => {
                for column in missing {
                    self.connection.execute(
                        &format!(
                            "alter table \"{table}\" add column \"{}\" {}",
                            column.name,
                            column.kind.sql_type()
                        ),
                        [],
                    )?;

                    info!(table = table, column = %column.name, "Extended result table");
                }

                debug!(table = table, "Reusing existing result table");
            }
        }

        self.registry = registry;

        Ok(merged)
    }

    pub fn store_iter<I: IntoIterator<Item = ResultRecord>>(
        &self,
        table: &str,
        records: I,
    ) -> Result<usize, ConnectionError> {
        let schema = self
            .registry
            .get(table)
            .ok_or_else(|| SchemaError::UndeclaredColumn {
                table: table.to_owned(),
                column: ID_COLUMN.to_owned(),
            })?;
        let mut counter = 0;

        // NOTE: We can guarantee that no nested transactions are present due to only having one
        // connection at a time.
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        for record in records {
            schema.validate(&record)?;

            let columns = std::iter::once(ID_COLUMN)
                .chain(record.values.keys().map(String::as_str))
                .map(|name| format!("\"{name}\""))
                .join(", ");
            let placeholders = std::iter::repeat("?")
                .take(record.values.len() + 1)
                .join(", ");
            let id = Value::Text(record.id.clone());

            tx.prepare_cached(&format!(
                "insert into \"{table}\" ({columns}) values ({placeholders})"
            ))?
            .execute(params_from_iter(
                std::iter::once(&id).chain(record.values.values()),
            ))?;

            debug!(table = table, id = %record.id, "Inserted record");
            counter += 1;
        }

        tx.commit()?;

        info!(table = table, "Stored {counter} records");

        Ok(counter)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, ConnectionError> {
        let count: i64 = self
            .connection
            .prepare_cached(
                "select count(*) from sqlite_master where type = 'table' and name = ? collate nocase",
            )?
            .query_row(params![table], |row| row.get(0))?;

        Ok(count > 0)
    }

    pub fn ids(&self, table: &str) -> Result<BTreeSet<String>, ConnectionError> {
        if !is_identifier(table) {
            return Err(SchemaError::InvalidIdentifier(table.to_owned()).into());
        }

        if !self.table_exists(table)? {
            return Ok(BTreeSet::new());
        }

        self.connection
            .prepare(&format!("select {ID_COLUMN} from \"{table}\""))?
            .query_map([], |row| row.get(0))?
            .try_fold(BTreeSet::new(), |mut init, result| {
                init.insert(result?);

                Ok::<BTreeSet<String>, ConnectionError>(init)
            })
    }

    pub fn records(&self, table: &str) -> Result<Vec<ResultRecord>, ConnectionError> {
        let columns = match self.existing_columns(table)? {
            Some(columns) => columns,
            None => return Ok(Vec::new()),
        };

        let mut statement = self.connection.prepare(&format!(
            "select {} from \"{table}\" order by {ID_COLUMN}",
            columns
                .iter()
                .map(|(name, _)| format!("\"{name}\""))
                .join(", ")
        ))?;

        let records = statement
            .query_map([], |row| {
                let mut record = ResultRecord::new(String::new());

                for (index, (name, declared)) in columns.iter().enumerate() {
                    let value = read_value(row.get_ref(index)?, ColumnType::from_sql_type(declared));

                    if name.eq_ignore_ascii_case(ID_COLUMN) {
                        record.id = value.as_str().unwrap_or_default().to_owned();
                    } else {
                        record.values.insert(name.clone(), value);
                    }
                }

                Ok(record)
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<ResultRecord>, ConnectionError>(init)
            })?;

        Ok(records)
    }
}
