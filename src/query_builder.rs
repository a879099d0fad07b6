use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::{
    Error,
    data_source::{DataResult, DataSource},
    parameterizer::{BindParams, BindToken, Parameterizer},
};

/// Deferred clauses of a query. Each slot holds the token of the value bound
/// by the most recent call that touched it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Operations {
    pub limit: Option<BindToken>,
    pub offset: Option<BindToken>,
}

impl Operations {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.offset.is_none()
    }
}

/// Immutable snapshot of a builder handed to [`DataSource::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub statement: String,
    /// Number of leading bind values referenced by `statement` itself; the
    /// rest were bound by operation calls.
    pub statement_params: usize,
    pub bind_params: BindParams,
    pub operations: Operations,
    pub profile_name: String,
}

/// Lazy query: a base statement plus `limit`/`offset` operations that only
/// reach the backend when [`QueryBuilder::value`] is called.
pub struct QueryBuilder {
    statement: String,
    statement_params: usize,
    operations: Operations,
    data_source: Arc<dyn DataSource>,
    profile_name: String,
    parameterizer: Parameterizer,
}

impl QueryBuilder {
    /// Wraps an already rendered statement. `parameterizer` must hold the
    /// values the statement's placeholders refer to.
    pub fn new(
        statement: impl Into<String>,
        profile_name: impl Into<String>,
        parameterizer: Parameterizer,
    ) -> Self {
        QueryBuilder {
            statement: statement.into(),
            statement_params: parameterizer.len(),
            operations: Operations::default(),
            data_source: parameterizer.data_source().clone(),
            profile_name: profile_name.into(),
            parameterizer,
        }
    }

    pub fn limit(&mut self, limit: impl Into<Value>) -> &mut Self {
        let token = self.parameterizer.bind(limit);
        self.operations.limit = Some(token);
        self
    }

    pub fn offset(&mut self, offset: impl Into<Value>) -> &mut Self {
        let token = self.parameterizer.bind(offset);
        self.operations.offset = Some(token);
        self
    }

    /// Sets both operations in one update. Offset is bound first.
    pub fn take(&mut self, limit: impl Into<Value>, offset: impl Into<Value>) -> &mut Self {
        let offset = self.parameterizer.bind(offset);
        let limit = self.parameterizer.bind(limit);
        self.operations = Operations {
            limit: Some(limit),
            offset: Some(offset),
        };
        self
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn operations(&self) -> &Operations {
        &self.operations
    }

    pub fn bind_params(&self) -> BindParams {
        self.parameterizer.values()
    }

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    pub fn to_execute_request(&self) -> ExecuteRequest {
        ExecuteRequest {
            statement: self.statement.clone(),
            statement_params: self.statement_params,
            bind_params: self.parameterizer.values(),
            operations: self.operations.clone(),
            profile_name: self.profile_name.clone(),
        }
    }

    /// Executes the current state. Every call runs the query again.
    pub async fn value(&self) -> Result<DataResult, Error> {
        let request = self.to_execute_request();
        tracing::debug!(
            profile = %request.profile_name,
            params = request.bind_params.len(),
            "materializing query builder"
        );
        self.data_source.execute(request).await
    }
}

impl fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("statement", &self.statement)
            .field("operations", &self.operations)
            .field("profile_name", &self.profile_name)
            .field("parameterizer", &self.parameterizer)
            .finish()
    }
}
