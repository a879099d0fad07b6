use std::{
    collections::HashMap,
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures_core::{future::BoxFuture, stream::BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::{
    Arguments, Column as _, Connection, Executor, Row as _, Statement as _, TypeInfo, ValueRef,
    Any, AnyPool,
    any::{AnyArguments, AnyPoolOptions, AnyRow},
    pool::PoolConnection,
};
use sqlx_core::try_stream;

use crate::{Error, ExecuteRequest, config::{Profile, ProfileConfig}};

use super::{
    Column, DBType, DataResult, DataSource, ExportOptions, FieldDataType, Row,
    cursor::{self, RowCursor},
    export::{ensure_directory, write_partitions},
    sql_utils::trim_statement,
};

/// Called with the profile name whenever a pooled connection fails its
/// liveness check and is evicted from the pool.
pub type PoolErrorHandler = Arc<dyn Fn(&str, &sqlx::Error) + Send + Sync>;

struct PoolEntry {
    pool: AnyPool,
    profile: Profile,
    checkouts: AtomicUsize,
}

/// [`DataSource`] over sqlx `Any` pools, one pool per profile.
///
/// Every profile of one instance must point at the same kind of backend,
/// since placeholder syntax is decided by the instance's dialect.
pub struct SqlxDataSource {
    dialect: DBType,
    profiles: Vec<Profile>,
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
    on_pool_error: Option<PoolErrorHandler>,
}

impl SqlxDataSource {
    pub fn new(dialect: DBType, profiles: impl IntoIterator<Item = Profile>) -> Self {
        sqlx::any::install_default_drivers();
        SqlxDataSource {
            dialect,
            profiles: profiles.into_iter().collect(),
            pools: RwLock::new(HashMap::new()),
            on_pool_error: None,
        }
    }

    /// Data source for every profile of `source_type` in `config`.
    pub fn from_config(config: &ProfileConfig, source_type: &str) -> Result<Self, Error> {
        let dialect = DBType::from_source_type(source_type)?;
        Ok(Self::new(
            dialect,
            config.profiles_of_type(source_type).cloned(),
        ))
    }

    pub fn with_pool_error_handler(mut self, handler: PoolErrorHandler) -> Self {
        self.on_pool_error = Some(handler);
        self
    }

    pub fn dialect(&self) -> DBType {
        self.dialect
    }

    pub fn into_dyn(self) -> Arc<dyn DataSource> {
        Arc::new(self)
    }

    fn entry(&self, profile: &str) -> Result<Arc<PoolEntry>, Error> {
        self.pools
            .read()
            .get(profile)
            .cloned()
            .ok_or_else(|| Error::profile_not_found(profile))
    }

    async fn activate_profile(&self, profile: &Profile) -> Result<(), Error> {
        let on_error = self.on_pool_error.clone();
        let name = profile.name.clone();
        let pool = AnyPoolOptions::new()
            .max_connections(profile.max_connections)
            .before_acquire(move |conn, _meta| {
                let on_error = on_error.clone();
                let name = name.clone();
                Box::pin(async move {
                    match conn.ping().await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            tracing::warn!(profile = %name, "dropping broken pooled connection: {e}");
                            if let Some(handler) = on_error {
                                handler(&name, &e);
                            }
                            Ok(false)
                        }
                    }
                })
            })
            .connect(&profile.url)
            .await
            .map_err(|e| Error::connection(&profile.name, e))?;

        let conn = pool
            .acquire()
            .await
            .map_err(|e| Error::connection(&profile.name, e))?;
        let backend = DBType::new(conn.backend_name())?;
        drop(conn);
        if backend != self.dialect {
            pool.close().await;
            return Err(Error::Configuration(format!(
                "profile `{}` points at {}, expected {}",
                profile.name,
                backend.backend_name(),
                self.dialect.backend_name()
            )));
        }

        tracing::debug!(profile = %profile.name, backend = backend.backend_name(), "pool ready");
        self.pools.write().insert(
            profile.name.clone(),
            Arc::new(PoolEntry {
                pool,
                profile: profile.clone(),
                checkouts: AtomicUsize::new(0),
            }),
        );
        Ok(())
    }

    async fn activate_all(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        for profile in &self.profiles {
            if self.pools.read().contains_key(&profile.name) {
                continue;
            }
            if let Err(e) = self.activate_profile(profile).await {
                tracing::warn!(profile = %profile.name, "profile failed to activate: {e}");
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(errors.into()),
        }
    }

    async fn execute_request(&self, request: ExecuteRequest) -> Result<DataResult, Error> {
        let entry = self.entry(&request.profile_name)?;
        let (sql, values) = self.dialect.compile(&request);
        tracing::debug!(profile = %request.profile_name, sql = %sql, params = values.len(), "execute");
        entry.open(sql, values).await
    }

    /// Streams the statement once, on one connection, so every partition
    /// comes from the same scan.
    async fn export_statement(&self, options: ExportOptions) -> Result<(), Error> {
        let entry = self.entry(&options.profile_name)?;
        ensure_directory(&options.directory)?;

        let statement = trim_statement(&options.statement).to_string();
        tracing::debug!(
            profile = %options.profile_name,
            partition_size = entry.profile.export_partition_size,
            "export started"
        );
        let rows = entry
            .open(statement, Vec::new())
            .await
            .map_err(|e| Error::Export(e.to_string()))?
            .into_data();
        let files = write_partitions(
            &options.directory,
            entry.profile.export_partition_size,
            rows,
        )
        .await?;
        tracing::debug!(profile = %options.profile_name, files = files.len(), "export finished");
        Ok(())
    }

    async fn close_all(&self) -> Result<(), Error> {
        let pools = mem::take(&mut *self.pools.write());
        for (name, entry) in pools {
            entry.pool.close().await;
            tracing::debug!(profile = %name, "pool closed");
        }
        Ok(())
    }
}

impl PoolEntry {
    async fn acquire(&self) -> Result<PoolConnection<Any>, Error> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::connection(&self.profile.name, e))?;
        let checkouts = self.checkouts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(profile = %self.profile.name, checkouts, "connection checked out");
        Ok(conn)
    }

    /// Checks out one connection and streams the rows of `sql` through it.
    /// The connection travels with the returned stream.
    async fn open(&self, sql: String, values: Vec<Value>) -> Result<DataResult, Error> {
        let mut conn = self.acquire().await?;

        let columns: Vec<Column> = (&mut *conn)
            .prepare(&sql)
            .await?
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), FieldDataType::from_type_name(c.type_info().name())))
            .collect();

        let rows = try_stream! {
            let mut conn = conn;
            let arguments = encode_arguments(values)?;
            let mut rows = sqlx::query_with(&sql, arguments).fetch(&mut *conn);
            while let Some(row) = rows.try_next().await? {
                r#yield!(row);
            }
            Ok(())
        };

        let data = cursor::open(
            SqlxCursor { rows: rows.boxed() },
            self.profile.chunk_size,
            &self.profile.name,
        )
        .await?;
        Ok(DataResult::new(columns, data))
    }
}

struct SqlxCursor {
    rows: BoxStream<'static, Result<AnyRow, sqlx::Error>>,
}

impl RowCursor for SqlxCursor {
    fn read(&mut self, max_rows: usize) -> BoxFuture<'_, Result<Vec<Row>, Error>> {
        Box::pin(async move {
            let mut page = Vec::with_capacity(max_rows);
            while page.len() < max_rows {
                match self.rows.try_next().await? {
                    Some(row) => page.push(decode_row(&row)?),
                    None => break,
                }
            }
            Ok(page)
        })
    }
}

fn encode_arguments<'q>(values: Vec<Value>) -> Result<AnyArguments<'q>, sqlx::Error> {
    let mut args = AnyArguments::default();
    for value in values {
        let added = match value {
            Value::Null => args.add(Option::<String>::None),
            Value::Bool(b) => args.add(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => args.add(i),
                None => args.add(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => args.add(s),
            other => args.add(other.to_string()),
        };
        added.map_err(sqlx::Error::Encode)?;
    }
    Ok(args)
}

/// Decodes by the type of each value, since computed columns often carry
/// no declared type.
fn decode_row(row: &AnyRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_owned();
            match type_name.as_str() {
                "BOOLEAN" => Value::from(row.try_get::<bool, _>(i)?),
                "SMALLINT" => Value::from(row.try_get::<i16, _>(i)?),
                "INTEGER" => Value::from(row.try_get::<i32, _>(i)?),
                "BIGINT" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => Value::from(row.try_get::<f32, _>(i)?),
                "DOUBLE" => Value::from(row.try_get::<f64, _>(i)?),
                "TEXT" => Value::from(row.try_get::<String, _>(i)?),
                "BLOB" => Value::from(row.try_get::<Vec<u8>, _>(i)?),
                _ => Value::Null,
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

impl DataSource for SqlxDataSource {
    fn activate(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.activate_all())
    }

    fn execute(&self, request: ExecuteRequest) -> BoxFuture<'_, Result<DataResult, Error>> {
        Box::pin(self.execute_request(request))
    }

    fn prepare(&self, parameter_index: usize) -> String {
        self.dialect.placeholder(parameter_index)
    }

    fn export(&self, options: ExportOptions) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.export_statement(options))
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.close_all())
    }
}

impl fmt::Debug for SqlxDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlxDataSource")
            .field("dialect", &self.dialect)
            .field("profiles", &self.profiles.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("active", &self.pools.read().len())
            .finish()
    }
}
