//! Request templates: `{% req %}` blocks rendered into query builders.
//!
//! ```text
//! {% req user %}
//! select * from users where id = {{ context.params.id }}
//! {% endreq %}
//!
//! {% req groups main %}
//! select * from groups where owner = {{ user.limit(1).value()[0].name }}
//! {% endreq %}
//! ```
//!
//! Each request block gets its own builder and parameterizer. Values output
//! inside a block bind through that block; builder methods bind through the
//! builder they are called on, wherever the call appears.

mod engine;
mod evaluator;
mod lexer;
mod parser;

pub use engine::*;
pub use evaluator::ScopeState;
