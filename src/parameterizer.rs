use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::data_source::DataSource;

/// Reference to one position of a [`Parameterizer`] sequence.
///
/// The placeholder is the backend syntax the owning data source produced for
/// the position (`$1`, `?1`, `?`); the index is the 1-based position itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindToken {
    index: usize,
    placeholder: String,
}

impl BindToken {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }
}

impl fmt::Display for BindToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.placeholder)
    }
}

/// Ordered token -> value mapping handed to a data source at execution time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindParams {
    entries: Vec<(BindToken, Value)>,
}

impl BindParams {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks a value up by its rendered placeholder, e.g. `get("$2")`.
    ///
    /// Only meaningful for dialects with numbered placeholders.
    pub fn get(&self, placeholder: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(token, _)| token.placeholder == placeholder)
            .map(|(_, value)| value)
    }

    /// Looks a value up by its 1-based position.
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        index
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BindToken, &Value)> {
        self.entries.iter().map(|(token, value)| (token, value))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, value)| value)
    }
}

/// Per-query bind value sequence.
///
/// Positions start at 1, are assigned strictly in bind order and are never
/// reused. There is no way to remove a bound value.
pub struct Parameterizer {
    data_source: Arc<dyn DataSource>,
    entries: Vec<(BindToken, Value)>,
}

impl Parameterizer {
    pub fn new(data_source: Arc<dyn DataSource>) -> Self {
        Parameterizer {
            data_source,
            entries: Vec::new(),
        }
    }

    /// Appends `value` at the next position and returns its token.
    pub fn bind(&mut self, value: impl Into<Value>) -> BindToken {
        let index = self.entries.len() + 1;
        let token = BindToken {
            index,
            placeholder: self.data_source.prepare(index),
        };
        self.entries.push((token.clone(), value.into()));
        token
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the bound values in bind order.
    pub fn values(&self) -> BindParams {
        BindParams {
            entries: self.entries.clone(),
        }
    }

    pub(crate) fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }
}

impl fmt::Debug for Parameterizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameterizer")
            .field("entries", &self.entries)
            .finish()
    }
}
