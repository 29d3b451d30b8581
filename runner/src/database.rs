pub mod schema;
pub mod sqlite;

pub use schema::{SchemaRegistry, TableSchema};
pub use sqlite::SharedConnection;

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// Name of the primary key column every result table carries
pub const ID_COLUMN: &str = "id";

/// A single result row as produced by a computation, column name -> value
pub type Row = BTreeMap<String, Value>;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("Connection is still shared with {0} other handle(s) and can't be closed")]
    StillShared(usize),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("'{0}' is not a valid table or column name")]
    InvalidIdentifier(String),
    #[error("Column '{column}' of table '{table}' is reserved for the record identifier")]
    ReservedColumn { table: String, column: String },
    #[error("Column '{column}' is declared twice for table '{table}'")]
    DuplicateColumn { table: String, column: String },
    #[error("Column '{table}.{column}' is declared as {declared} but already exists as {existing}")]
    ConflictingColumn {
        table: String,
        column: String,
        declared: String,
        existing: String,
    },
    #[error("Column '{column}' is not declared for table '{table}'")]
    UndeclaredColumn { table: String, column: String },
    #[error("Column '{table}.{column}' expects {expected} but got {found}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: ColumnType,
        found: &'static str,
    },
    #[error("Record without a usable identifier for table '{0}'")]
    MissingId(String),
}

/// Scalar column types a result table can declare
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
        }
    }

    /// map a declared SQLite column type back, returns None for foreign types
    pub fn from_sql_type(declared: &str) -> Option<Self> {
        match declared.trim().to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "integer" => Some(Self::Integer),
            "real" => Some(Self::Real),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }

    /// check if a value can be stored in a column of this type
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Text, Value::Text(_))
                | (Self::Integer, Value::Integer(_))
                | (Self::Real, Value::Real(_))
                | (Self::Real, Value::Integer(_))
                | (Self::Boolean, Value::Boolean(_))
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

/// A declared result column
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One row of a stage's result table, keyed by a stable identifier
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub id: String,
    pub values: Row,
}

impl ResultRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: Row::new(),
        }
    }

    /// builder style setter for a single column
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// unpack a computed row into a record, the identifier is taken from the `id` key
    pub fn from_row(table: &str, mut row: Row) -> Result<Self, SchemaError> {
        let id = match row.remove(ID_COLUMN) {
            Some(Value::Text(id)) if !id.is_empty() => id,
            Some(Value::Integer(id)) => id.to_string(),
            _ => return Err(SchemaError::MissingId(table.to_owned())),
        };

        Ok(Self { id, values: row })
    }
}
