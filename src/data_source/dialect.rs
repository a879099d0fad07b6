use serde_json::Value;

use crate::{
    Error,
    parameterizer::{BindParams, BindToken},
    query_builder::{ExecuteRequest, Operations},
};

use super::sql_utils::trim_statement;

/// Database type enumeration supporting major database systems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DBType {
    /// PostgreSQL database
    PostgreSQL,
    /// MySQL database
    MySQL,
    /// SQLite database
    SQLite,
}

impl DBType {
    /// Creates a DBType from a backend name as reported by a connection
    /// ("PostgreSQL" | "MySQL" | "SQLite").
    pub fn new(db_name: &str) -> Result<Self, Error> {
        match db_name {
            "PostgreSQL" => Ok(Self::PostgreSQL),
            "MySQL" => Ok(Self::MySQL),
            "SQLite" => Ok(Self::SQLite),
            _ => Err(Error::Configuration(format!("unsupport db `{db_name}`"))),
        }
    }

    /// Creates a DBType from a profile `type` (`postgres`, `mysql`, `sqlite`).
    pub fn from_source_type(source_type: &str) -> Result<Self, Error> {
        match source_type {
            "postgres" | "postgresql" | "pg" => Ok(Self::PostgreSQL),
            "mysql" | "mariadb" => Ok(Self::MySQL),
            "sqlite" => Ok(Self::SQLite),
            _ => Err(Error::Configuration(format!(
                "unsupport data source type `{source_type}`"
            ))),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Gets placeholder generation function for parameter binding
    ///
    /// Database-specific placeholder formats:
    /// - PostgreSQL: $1, $2...
    /// - SQLite: ?1, ?2...
    /// - MySQL: ?
    pub fn get_encode_placeholder_fn(&self) -> fn(usize, &mut String) {
        match self {
            Self::PostgreSQL => |i: usize, s: &mut String| s.push_str(&format!("${i}")),
            Self::SQLite => |i: usize, s: &mut String| s.push_str(&format!("?{i}")),
            Self::MySQL => |_: usize, s: &mut String| s.push('?'),
        }
    }

    pub fn placeholder(&self, index: usize) -> String {
        let mut s = String::new();
        self.get_encode_placeholder_fn()(index, &mut s);
        s
    }

    /// Compiles the request's operations into backend SQL and returns the
    /// final statement with the values to bind, in backend order.
    ///
    /// The statement is wrapped in a derived table so operations never clash
    /// with clauses the template already wrote. Only the statement's own
    /// values and the current operation values are sent; values left behind
    /// by an overwritten operation are dropped and the operation placeholders
    /// are numbered after the statement's.
    pub fn compile(&self, request: &ExecuteRequest) -> (String, Vec<Value>) {
        let statement = trim_statement(&request.statement);
        let ExecuteRequest {
            operations,
            bind_params,
            statement_params,
            ..
        } = request;
        let mut values: Vec<Value> = bind_params
            .values()
            .take(*statement_params)
            .cloned()
            .collect();
        if operations.is_empty() {
            return (statement.to_string(), values);
        }
        let mut sql = format!("SELECT * FROM ({statement}) AS t");
        self.write_operations(&mut sql, operations, bind_params, &mut values);
        (sql, values)
    }

    fn write_operations(
        &self,
        sql: &mut String,
        operations: &Operations,
        bind_params: &BindParams,
        values: &mut Vec<Value>,
    ) {
        let f = self.get_encode_placeholder_fn();
        let value_of = |token: &BindToken| {
            bind_params
                .value_at(token.index())
                .cloned()
                .unwrap_or(Value::Null)
        };
        match &operations.limit {
            Some(limit) => {
                values.push(value_of(limit));
                sql.push_str(" LIMIT ");
                f(values.len(), sql);
            }
            None => match self {
                // SQLite does not accept OFFSET without LIMIT; -1 means no limit
                Self::SQLite => sql.push_str(" LIMIT -1"),
                // MySQL has no OFFSET without LIMIT; this is its documented "all rows"
                Self::MySQL => sql.push_str(" LIMIT 18446744073709551615"),
                Self::PostgreSQL => {}
            },
        }
        if let Some(offset) = &operations.offset {
            values.push(value_of(offset));
            sql.push_str(" OFFSET ");
            f(values.len(), sql);
        }
    }
}
