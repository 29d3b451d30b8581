use super::{Column, ColumnType, ResultRecord, SchemaError, ID_COLUMN};
use std::collections::BTreeMap;
use tracing::debug;

/// check if a name can safely be used as an unquoted SQL identifier
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Declared layout of a single result table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    table: String,
    columns: Vec<Column>,
}

impl TableSchema {
    /// validate names and build a schema, the `id` column is implicit
    pub fn new(table: impl Into<String>, columns: Vec<Column>) -> Result<Self, SchemaError> {
        let table = table.into();

        if !is_identifier(&table) {
            return Err(SchemaError::InvalidIdentifier(table));
        }

        for (index, column) in columns.iter().enumerate() {
            if !is_identifier(&column.name) {
                return Err(SchemaError::InvalidIdentifier(column.name.clone()));
            }

            if column.name.eq_ignore_ascii_case(ID_COLUMN) {
                return Err(SchemaError::ReservedColumn {
                    table,
                    column: column.name.clone(),
                });
            }

            if columns[..index]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(SchemaError::DuplicateColumn {
                    table,
                    column: column.name.clone(),
                });
            }
        }

        Ok(Self { table, columns })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column(name).map(|column| column.kind)
    }

    /// check that a record only carries declared columns of the right type
    pub fn validate(&self, record: &ResultRecord) -> Result<(), SchemaError> {
        if record.id.is_empty() {
            return Err(SchemaError::MissingId(self.table.clone()));
        }

        for (name, value) in record.values.iter() {
            match self.column_type(name) {
                Some(kind) if kind.accepts(value) => {}
                Some(kind) => {
                    return Err(SchemaError::TypeMismatch {
                        table: self.table.clone(),
                        column: name.clone(),
                        expected: kind,
                        found: value.kind(),
                    })
                }
                None => {
                    return Err(SchemaError::UndeclaredColumn {
                        table: self.table.clone(),
                        column: name.clone(),
                    })
                }
            }
        }

        Ok(())
    }

    /// merge another declaration of the same table into this one
    /// columns may be added but never change their type
    pub fn merge(&mut self, other: &TableSchema) -> Result<Vec<Column>, SchemaError> {
        let mut added = Vec::new();

        for column in other.columns.iter() {
            match self.column(&column.name) {
                Some(existing) if existing.kind != column.kind => {
                    return Err(SchemaError::ConflictingColumn {
                        table: self.table.clone(),
                        column: column.name.clone(),
                        declared: column.kind.to_string(),
                        existing: existing.kind.to_string(),
                    });
                }
                Some(_) => {}
                None => added.push(column.clone()),
            }
        }

        self.columns.extend(added.iter().cloned());

        Ok(added)
    }
}

/// Registry of every table declared during a session
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a declaration and return the combined schema of the table
    pub fn register(&mut self, schema: &TableSchema) -> Result<TableSchema, SchemaError> {
        match self.tables.get_mut(schema.table()) {
            Some(existing) => {
                let added = existing.merge(schema)?;

                if !added.is_empty() {
                    debug!(table = schema.table(), added = added.len(), "Extended registered schema");
                }

                Ok(existing.clone())
            }
            None => {
                self.tables
                    .insert(schema.table().to_owned(), schema.clone());

                Ok(schema.clone())
            }
        }
    }

    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}
