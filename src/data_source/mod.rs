use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc};

use futures_core::{future::BoxFuture, stream::BoxStream};
use futures_util::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, ExecuteRequest};

pub mod cursor;
mod dialect;
pub mod export;
pub mod sql_utils;
mod sqlx_source;

pub use dialect::*;
pub use sqlx_source::*;

/// One result row keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Lazy, finite, non-restartable sequence of rows.
pub type RowStream = BoxStream<'static, Result<Row, Error>>;

/// Logical type of a result column, as exposed to schema tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldDataType {
    Boolean,
    Integer,
    Number,
    String,
    Binary,
    Unknown,
}

impl FieldDataType {
    /// Maps a backend type name (`BIGINT`, `TEXT`, `DOUBLE`, ...) to its
    /// logical type.
    pub fn from_type_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "BOOLEAN" | "BOOL" => Self::Boolean,
            "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "INT2" | "INT4" | "INT8" => Self::Integer,
            "REAL" | "DOUBLE" | "FLOAT" | "FLOAT4" | "FLOAT8" | "NUMERIC" | "DECIMAL" => {
                Self::Number
            }
            "TEXT" | "VARCHAR" | "CHAR" | "STRING" => Self::String,
            "BLOB" | "BYTEA" | "BINARY" => Self::Binary,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: FieldDataType,
}

impl Column {
    pub fn new(name: impl Into<String>, logical_type: FieldDataType) -> Self {
        Column {
            name: name.into(),
            logical_type,
        }
    }
}

/// Column metadata plus the lazy row stream of one execution.
pub struct DataResult {
    columns: Vec<Column>,
    data: RowStream,
}

impl DataResult {
    pub fn new(columns: Vec<Column>, data: RowStream) -> Self {
        DataResult { columns, data }
    }

    /// Result over rows already held in memory.
    pub fn from_rows(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        DataResult::new(columns, stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_data(self) -> RowStream {
        self.data
    }

    /// Drains the row stream into memory.
    ///
    /// ### Note: beware result set size.
    /// Ensure the query has a known upper bound, e.g. using `limit`.
    pub async fn fetch_all(self) -> Result<Vec<Row>, Error> {
        self.data.try_collect().await
    }
}

impl fmt::Debug for DataResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataResult")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub statement: String,
    pub directory: PathBuf,
    pub profile_name: String,
}

/// Capabilities every backend adapter provides.
///
/// Methods return boxed futures so adapters can be stored as
/// `Arc<dyn DataSource>` and selected by profile type at runtime.
pub trait DataSource: Send + Sync {
    /// Opens a pool for every configured profile. A profile failing its probe
    /// does not keep the other profiles from activating.
    fn activate(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Compiles `request.operations` into the statement, executes it on one
    /// exclusively checked-out connection and returns a lazy result. The
    /// connection is released exactly once, whether the stream completes,
    /// is dropped early or fails.
    fn execute(&self, request: ExecuteRequest) -> BoxFuture<'_, Result<DataResult, Error>>;

    /// Backend placeholder for a 1-based parameter position.
    fn prepare(&self, parameter_index: usize) -> String;

    /// Writes the full result set of `options.statement` into files under
    /// `options.directory`. Profile and directory are validated before any
    /// network interaction.
    fn export(&self, options: ExportOptions) -> BoxFuture<'_, Result<(), Error>>;

    /// Closes every pool. Calling it again is a no-op.
    fn destroy(&self) -> BoxFuture<'_, Result<(), Error>>;
}

/// Data sources by type name (`postgres`, `sqlite`, ...), matched against
/// the `type` of a profile.
#[derive(Default, Clone)]
pub struct DataSourceRegistry {
    sources: HashMap<String, Arc<dyn DataSource>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        source_type: impl Into<String>,
        source: Arc<dyn DataSource>,
    ) -> Result<(), Error> {
        let source_type = source_type.into();
        if self.sources.contains_key(&source_type) {
            return Err(Error::Configuration(format!(
                "data source `{source_type}` has been registered twice"
            )));
        }
        self.sources.insert(source_type, source);
        Ok(())
    }

    pub fn get(&self, source_type: &str) -> Result<Arc<dyn DataSource>, Error> {
        self.sources.get(source_type).cloned().ok_or_else(|| {
            Error::Configuration(format!("data source `{source_type}` is not registered"))
        })
    }

    /// Activates every source; errors are collected rather than short-circuited.
    pub async fn activate_all(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        for (name, source) in &self.sources {
            tracing::debug!(source = %name, "activating data source");
            if let Err(e) = source.activate().await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    pub async fn destroy_all(&self) -> Result<(), Error> {
        for source in self.sources.values() {
            source.destroy().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.sources.keys()).finish()
    }
}
