#![doc = include_str!("../README.md")]

pub mod config;
pub mod data_source;
mod error;
mod parameterizer;
mod query_builder;
pub mod template;
mod template_arg;
#[cfg(test)]
mod test_support;

pub use config::{Profile, ProfileConfig};
pub use data_source::{
    Column, DBType, DataResult, DataSource, DataSourceRegistry, ExportOptions, FieldDataType, Row,
    RowStream, SqlxDataSource,
};
pub use error::*;
pub use parameterizer::*;
pub use query_builder::*;
pub use template::{ExecuteContext, Pagination, TemplateEngine, TemplateMetadata};
pub use template_arg::*;
