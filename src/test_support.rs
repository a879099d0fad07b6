use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures_core::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    Error, ExecuteRequest,
    data_source::{Column, DBType, DataResult, DataSource, ExportOptions, FieldDataType, Row},
};

enum Scripted {
    Rows(Vec<Row>),
    Fail(String),
}

/// In-memory data source recording every request it receives.
///
/// Results are served from a queue; once it is empty every execution
/// returns zero rows.
pub(crate) struct StubDataSource {
    dialect: DBType,
    requests: Mutex<Vec<ExecuteRequest>>,
    exports: Mutex<Vec<ExportOptions>>,
    results: Mutex<VecDeque<Scripted>>,
    pub(crate) activations: AtomicUsize,
    pub(crate) destroys: AtomicUsize,
}

impl StubDataSource {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_dialect(DBType::PostgreSQL)
    }

    pub(crate) fn with_dialect(dialect: DBType) -> Arc<Self> {
        Arc::new(StubDataSource {
            dialect,
            requests: Mutex::new(Vec::new()),
            exports: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::new()),
            activations: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        })
    }

    pub(crate) fn into_dyn(self: Arc<Self>) -> Arc<dyn DataSource> {
        self
    }

    /// Queues the rows returned by the next execution.
    pub(crate) fn push_rows(&self, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        self.results.lock().push_back(Scripted::Rows(rows));
    }

    /// Makes the next execution fail with `message`.
    pub(crate) fn push_failure(&self, message: &str) {
        self.results
            .lock()
            .push_back(Scripted::Fail(message.to_string()));
    }

    pub(crate) fn requests(&self) -> Vec<ExecuteRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn exports(&self) -> Vec<ExportOptions> {
        self.exports.lock().clone()
    }

    pub(crate) fn executions(&self) -> usize {
        self.requests.lock().len()
    }
}

impl DataSource for StubDataSource {
    fn activate(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn execute(&self, request: ExecuteRequest) -> BoxFuture<'_, Result<DataResult, Error>> {
        self.requests.lock().push(request);
        let scripted = self.results.lock().pop_front();
        Box::pin(async move {
            match scripted {
                Some(Scripted::Fail(message)) => Err(Error::Message(message)),
                Some(Scripted::Rows(rows)) => {
                    let columns = rows
                        .first()
                        .map(|row| {
                            row.keys()
                                .map(|k| Column::new(k, FieldDataType::Unknown))
                                .collect()
                        })
                        .unwrap_or_default();
                    Ok(DataResult::from_rows(columns, rows))
                }
                None => Ok(DataResult::from_rows(Vec::new(), Vec::new())),
            }
        })
    }

    fn prepare(&self, parameter_index: usize) -> String {
        self.dialect.placeholder(parameter_index)
    }

    fn export(&self, options: ExportOptions) -> BoxFuture<'_, Result<(), Error>> {
        self.exports.lock().push(options);
        Box::pin(async { Ok(()) })
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}
