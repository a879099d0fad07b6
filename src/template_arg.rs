use std::{cell::RefCell, sync::Arc};

use serde_json::Value;

use crate::{Error, Parameterizer, QueryBuilder, data_source::DataSource};

/// Values that can be bound through [`BindArg`].
///
/// Askama hands method arguments over by reference for anything that is not
/// a literal, so every type is accepted both owned and borrowed.
pub trait IntoBindValue {
    fn into_bind_value(self) -> Value;
}

macro_rules! impl_into_bind_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl IntoBindValue for $t {
                fn into_bind_value(self) -> Value {
                    Value::from(self)
                }
            }

            impl IntoBindValue for &$t {
                #[allow(clippy::clone_on_copy)]
                fn into_bind_value(self) -> Value {
                    Value::from(self.clone())
                }
            }
        )*
    };
}

impl_into_bind_value!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String);

impl IntoBindValue for &str {
    fn into_bind_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoBindValue for &&str {
    fn into_bind_value(self) -> Value {
        Value::from(*self)
    }
}

impl IntoBindValue for Value {
    fn into_bind_value(self) -> Value {
        self
    }
}

impl IntoBindValue for &Value {
    fn into_bind_value(self) -> Value {
        self.clone()
    }
}

impl<T: IntoBindValue> IntoBindValue for Option<T> {
    fn into_bind_value(self) -> Value {
        self.map_or(Value::Null, IntoBindValue::into_bind_value)
    }
}

impl<'a, T> IntoBindValue for &'a Option<T>
where
    &'a T: IntoBindValue,
{
    fn into_bind_value(self) -> Value {
        self.as_ref().map_or(Value::Null, IntoBindValue::into_bind_value)
    }
}

/// Binding helper for compile-time askama templates.
///
/// Put a `BindArg` field on the template struct and route every value
/// through it: `{{ arg.e(user_id) }}` binds one value, `{{ arg.el(ids) }}` a
/// parenthesized list. Rendering goes through [`QueryBuilder::from_template`],
/// which supplies the parameterizer.
#[derive(Default)]
pub struct BindArg {
    parameterizer: RefCell<Option<Parameterizer>>,
    error: RefCell<Option<Error>>,
}

impl BindArg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds one value and returns its placeholder (e.g. `$1` or `?`).
    pub fn e(&self, value: impl IntoBindValue) -> String {
        let mut parameterizer = self.parameterizer.borrow_mut();
        match parameterizer.as_mut() {
            Some(p) => p.bind(value.into_bind_value()).to_string(),
            None => {
                let mut err = self.error.borrow_mut();
                if err.is_none() {
                    *err = Some(Error::Message(
                        "BindArg used outside of QueryBuilder::from_template".into(),
                    ));
                }
                String::new()
            }
        }
    }

    /// Binds every value and returns comma-separated placeholders in
    /// parentheses.
    pub fn el<I>(&self, values: I) -> String
    where
        I: IntoIterator,
        I::Item: IntoBindValue,
    {
        let placeholders: Vec<String> = values.into_iter().map(|v| self.e(v)).collect();
        format!("({})", placeholders.join(","))
    }

    fn install(&self, parameterizer: Parameterizer) {
        *self.parameterizer.borrow_mut() = Some(parameterizer);
        self.error.borrow_mut().take();
    }

    fn finish(&self) -> (Option<Parameterizer>, Option<Error>) {
        (
            self.parameterizer.borrow_mut().take(),
            self.error.borrow_mut().take(),
        )
    }
}

/// An askama template whose values are bound through a [`BindArg`].
pub trait SqlTemplate: askama::Template {
    fn bind_arg(&self) -> &BindArg;
}

impl QueryBuilder {
    /// Renders `template` into a builder whose parameterizer holds every
    /// value the template bound, in render order.
    pub fn from_template<T: SqlTemplate>(
        template: &T,
        data_source: Arc<dyn DataSource>,
        profile_name: impl Into<String>,
    ) -> Result<QueryBuilder, Error> {
        let arg = template.bind_arg();
        arg.install(Parameterizer::new(data_source.clone()));
        let rendered = template.render();
        let (parameterizer, error) = arg.finish();
        let sql = rendered?;
        if let Some(e) = error {
            return Err(e);
        }
        let parameterizer = parameterizer.unwrap_or_else(|| Parameterizer::new(data_source));
        Ok(QueryBuilder::new(sql, profile_name, parameterizer))
    }
}
