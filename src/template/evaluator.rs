use std::{cmp::Ordering, collections::HashMap, fmt, sync::Arc};

use futures_core::future::BoxFuture;
use serde_json::Value;

use crate::{
    Error, Parameterizer, QueryBuilder,
    data_source::{DataResult, DataSource},
};

use super::parser::{BinaryOp, CONTEXT_VAR, Expr, Method, Node};

/// Lifecycle of one request scope within an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Statement rendered, no operation applied yet.
    Pending,
    /// One or more operations applied.
    Configured,
    /// Execution dispatched.
    Materializing,
    Resolved,
    Failed,
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScopeState::Pending => "pending",
            ScopeState::Configured => "configured",
            ScopeState::Materializing => "materializing",
            ScopeState::Resolved => "resolved",
            ScopeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Handle to a request scope in the evaluation arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScopeId(usize);

struct RequestScope {
    name: String,
    main: bool,
    builder: QueryBuilder,
    state: ScopeState,
}

/// Runtime value: plain JSON, or a reference to a request's builder.
#[derive(Debug, Clone)]
enum Val {
    Json(Value),
    Query(ScopeId),
}

/// Text being rendered. Inside a request block, `binder` is that block's
/// parameterizer and every output expression is bound through it.
struct Frame {
    text: String,
    binder: Option<Parameterizer>,
}

/// State of one template evaluation. Every builder it creates lives in
/// `scopes` and is dropped with it.
pub(crate) struct Evaluation {
    template: String,
    profile: String,
    data_source: Arc<dyn DataSource>,
    scopes: Vec<RequestScope>,
    vars: HashMap<String, Val>,
}

impl Evaluation {
    pub(crate) fn new(
        template: &str,
        profile: &str,
        data_source: Arc<dyn DataSource>,
        context: Value,
    ) -> Self {
        Evaluation {
            template: template.to_string(),
            profile: profile.to_string(),
            data_source,
            scopes: Vec::new(),
            vars: HashMap::from([(CONTEXT_VAR.to_string(), Val::Json(context))]),
        }
    }

    /// Renders the template top to bottom. Text outside request blocks is
    /// discarded.
    pub(crate) async fn run(&mut self, nodes: &[Node]) -> Result<(), Error> {
        let mut top = Frame {
            text: String::new(),
            binder: None,
        };
        self.render(nodes, &mut top).await
    }

    pub(crate) fn main(&self) -> Option<ScopeId> {
        self.scopes.iter().position(|s| s.main).map(ScopeId)
    }

    #[cfg(test)]
    pub(crate) fn scope(&self, name: &str) -> Option<ScopeId> {
        self.scopes.iter().position(|s| s.name == name).map(ScopeId)
    }

    #[cfg(test)]
    pub(crate) fn state(&self, id: ScopeId) -> ScopeState {
        self.scopes[id.0].state
    }

    #[cfg(test)]
    pub(crate) fn builder(&self, id: ScopeId) -> &QueryBuilder {
        &self.scopes[id.0].builder
    }

    /// Applies `limit`, `offset` or `take` to a scope that has not started
    /// materializing.
    pub(crate) fn configure(
        &mut self,
        id: ScopeId,
        method: Method,
        args: Vec<Value>,
    ) -> Result<(), Error> {
        let scope = &mut self.scopes[id.0];
        if !matches!(scope.state, ScopeState::Pending | ScopeState::Configured) {
            return Err(Error::Scope {
                scope: scope.name.clone(),
                message: format!("cannot call `{}` on a {} query", method.name(), scope.state),
            });
        }
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::Null);
        match method {
            Method::Limit => {
                scope.builder.limit(next());
            }
            Method::Offset => {
                scope.builder.offset(next());
            }
            Method::Take => {
                let limit = next();
                let offset = next();
                scope.builder.take(limit, offset);
            }
            Method::Value => {}
        }
        scope.state = ScopeState::Configured;
        Ok(())
    }

    /// Executes the scope's builder against its current state. A resolved
    /// scope executes again.
    pub(crate) async fn materialize(&mut self, id: ScopeId) -> Result<DataResult, Error> {
        let scope = &mut self.scopes[id.0];
        if scope.state == ScopeState::Failed {
            return Err(Error::Scope {
                scope: scope.name.clone(),
                message: "query already failed".into(),
            });
        }
        scope.state = ScopeState::Materializing;
        tracing::debug!(template = %self.template, scope = %scope.name, "materializing request");
        match scope.builder.value().await {
            Ok(result) => {
                scope.state = ScopeState::Resolved;
                Ok(result)
            }
            Err(e) => {
                scope.state = ScopeState::Failed;
                Err(e)
            }
        }
    }

    /// Materializes the scope and collects its rows into a JSON array.
    async fn resolve(&mut self, id: ScopeId) -> Result<Value, Error> {
        let result = self.materialize(id).await?;
        match result.fetch_all().await {
            Ok(rows) => Ok(Value::Array(rows.into_iter().map(Value::Object).collect())),
            Err(e) => {
                self.scopes[id.0].state = ScopeState::Failed;
                Err(e)
            }
        }
    }

    fn error(&self, message: String) -> Error {
        Error::Template {
            template: self.template.clone(),
            message,
        }
    }

    fn render<'a>(
        &'a mut self,
        nodes: &'a [Node],
        frame: &'a mut Frame,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            for node in nodes {
                match node {
                    Node::Text(text) => frame.text.push_str(text),
                    Node::Output(expr) => {
                        let value = self.eval_json(expr).await?;
                        match frame.binder.as_mut() {
                            Some(parameterizer) => {
                                let token = parameterizer.bind(value);
                                frame.text.push_str(token.placeholder());
                            }
                            None => frame.text.push_str(&display(&value)),
                        }
                    }
                    Node::Set { name, value } => {
                        let value = self.eval(value).await?;
                        self.vars.insert(name.clone(), value);
                    }
                    Node::If {
                        branches,
                        otherwise,
                    } => {
                        let mut chosen = otherwise;
                        for (condition, body) in branches {
                            if truthy(&self.eval(condition).await?) {
                                chosen = body;
                                break;
                            }
                        }
                        self.render(chosen, frame).await?;
                    }
                    Node::Req { name, main, body } => {
                        let mut inner = Frame {
                            text: String::new(),
                            binder: Some(Parameterizer::new(self.data_source.clone())),
                        };
                        self.render(body, &mut inner).await?;
                        let Frame { text, binder } = inner;
                        let parameterizer =
                            binder.unwrap_or_else(|| Parameterizer::new(self.data_source.clone()));
                        let builder =
                            QueryBuilder::new(text.trim(), self.profile.clone(), parameterizer);
                        let id = ScopeId(self.scopes.len());
                        tracing::debug!(
                            template = %self.template,
                            scope = %name,
                            params = builder.bind_params().len(),
                            "request scope created"
                        );
                        self.scopes.push(RequestScope {
                            name: name.clone(),
                            main: *main,
                            builder,
                            state: ScopeState::Pending,
                        });
                        self.vars.insert(name.clone(), Val::Query(id));
                    }
                    Node::Error(code) => {
                        return Err(self.error(format!("template raised `{code}`")));
                    }
                }
            }
            Ok(())
        })
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<Val, Error>> {
        Box::pin(async move {
            match expr {
                Expr::Literal(value) => Ok(Val::Json(value.clone())),
                Expr::Var(name) => self
                    .vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| self.error(format!("`{name}` is not defined here"))),
                Expr::Attr(target, field) => {
                    let target = self.eval_json(target).await?;
                    match &target {
                        Value::Object(map) => Ok(Val::Json(map.get(field).cloned().unwrap_or(Value::Null))),
                        other => Err(self.error(format!(
                            "cannot read `{field}` of {}",
                            kind(other)
                        ))),
                    }
                }
                Expr::Index(target, index) => {
                    let target = self.eval_json(target).await?;
                    let index = self.eval_json(index).await?;
                    match (&target, &index) {
                        (Value::Array(items), Value::Number(n)) => {
                            let item = n
                                .as_u64()
                                .and_then(|i| items.get(i as usize))
                                .cloned()
                                .unwrap_or(Value::Null);
                            Ok(Val::Json(item))
                        }
                        (Value::Object(map), Value::String(key)) => {
                            Ok(Val::Json(map.get(key).cloned().unwrap_or(Value::Null)))
                        }
                        _ => Err(self.error(format!(
                            "cannot index {} with {}",
                            kind(&target),
                            kind(&index)
                        ))),
                    }
                }
                Expr::Call {
                    target,
                    method,
                    args,
                } => {
                    let Val::Query(id) = self.eval(target).await? else {
                        return Err(self.error(format!(
                            "`{}` can only be called on a request",
                            method.name()
                        )));
                    };
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval_json(arg).await?);
                    }
                    if *method == Method::Value {
                        return Ok(Val::Json(self.resolve(id).await?));
                    }
                    self.configure(id, *method, values)?;
                    Ok(Val::Query(id))
                }
                Expr::Not(inner) => {
                    let value = self.eval(inner).await?;
                    Ok(Val::Json(Value::Bool(!truthy(&value))))
                }
                Expr::Binary(BinaryOp::And, lhs, rhs) => {
                    let lhs = self.eval(lhs).await?;
                    if !truthy(&lhs) {
                        return Ok(lhs);
                    }
                    self.eval(rhs).await
                }
                Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                    let lhs = self.eval(lhs).await?;
                    if truthy(&lhs) {
                        return Ok(lhs);
                    }
                    self.eval(rhs).await
                }
                Expr::Binary(op, lhs, rhs) => {
                    let lhs = self.eval_json(lhs).await?;
                    let rhs = self.eval_json(rhs).await?;
                    let result = match op {
                        BinaryOp::Eq => json_eq(&lhs, &rhs),
                        BinaryOp::Ne => !json_eq(&lhs, &rhs),
                        _ => {
                            let ordering = json_cmp(&lhs, &rhs).ok_or_else(|| {
                                self.error(format!("cannot compare {} with {}", kind(&lhs), kind(&rhs)))
                            })?;
                            match op {
                                BinaryOp::Lt => ordering == Ordering::Less,
                                BinaryOp::Le => ordering != Ordering::Greater,
                                BinaryOp::Gt => ordering == Ordering::Greater,
                                _ => ordering != Ordering::Less,
                            }
                        }
                    };
                    Ok(Val::Json(Value::Bool(result)))
                }
            }
        })
    }

    /// Evaluates to plain JSON; a request used as a value is materialized.
    fn eval_json<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move {
            match self.eval(expr).await? {
                Val::Json(value) => Ok(value),
                Val::Query(id) => self.resolve(id).await,
            }
        })
    }
}

fn truthy(value: &Val) -> bool {
    match value {
        Val::Query(_) => true,
        Val::Json(Value::Null) => false,
        Val::Json(Value::Bool(b)) => *b,
        Val::Json(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Val::Json(Value::String(s)) => !s.is_empty(),
        Val::Json(Value::Array(a)) => !a.is_empty(),
        Val::Json(Value::Object(o)) => !o.is_empty(),
    }
}

fn json_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

fn json_cmp(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{template::parser::compile, test_support::StubDataSource};

    async fn evaluate(
        source: &str,
        params: Value,
        stub: &Arc<StubDataSource>,
    ) -> (Evaluation, Result<(), Error>) {
        let nodes = compile(source).unwrap();
        let mut evaluation = Evaluation::new(
            "test",
            "main-db",
            stub.clone().into_dyn(),
            json!({ "params": params }),
        );
        let result = evaluation.run(&nodes).await;
        (evaluation, result)
    }

    #[tokio::test]
    async fn literals_bind_through_their_own_block() {
        let stub = StubDataSource::new();
        let (evaluation, result) = evaluate(
            "{% req a %}select {{ context.params.x }}, {{ 'y' }}{% endreq %}\
             {% req b %}select {{ context.params.x }}{% endreq %}",
            json!({ "x": 7 }),
            &stub,
        )
        .await;
        result.unwrap();

        let a = evaluation.builder(evaluation.scope("a").unwrap());
        let b = evaluation.builder(evaluation.scope("b").unwrap());
        assert_eq!(a.statement(), "select $1, $2");
        assert_eq!(b.statement(), "select $1");
        assert_eq!(a.bind_params().len(), 2);
        assert_eq!(b.bind_params().value_at(1), Some(&json!(7)));
        assert_eq!(stub.executions(), 0);
    }

    #[tokio::test]
    async fn chained_calls_configure_the_callee() {
        let stub = StubDataSource::new();
        let (evaluation, result) = evaluate(
            "{% req user %}select * from users{% endreq %}\
             {% req audit %}select {{ 1 }}{% endreq %}\
             {% set u = user.offset(20).limit(5) %}{% set v = u.limit(10) %}",
            json!({}),
            &stub,
        )
        .await;
        result.unwrap();

        let user = evaluation.scope("user").unwrap();
        let audit = evaluation.scope("audit").unwrap();
        assert_eq!(evaluation.state(user), ScopeState::Configured);
        assert_eq!(evaluation.state(audit), ScopeState::Pending);
        let params = evaluation.builder(user).bind_params();
        assert_eq!(params.len(), 3);
        assert_eq!(params.value_at(3), Some(&json!(10)));
        assert_eq!(evaluation.builder(audit).bind_params().len(), 1);
    }

    #[tokio::test]
    async fn value_materializes_and_feeds_the_caller() {
        let stub = StubDataSource::new();
        stub.push_rows(vec![json!({ "id": 1, "name": "freda" })]);
        let (evaluation, result) = evaluate(
            "{% req user %}select * from users{% endreq %}\
             {% req group %}select * from groups where owner = {{ user.value()[0].name }}{% endreq %}",
            json!({}),
            &stub,
        )
        .await;
        result.unwrap();

        let user = evaluation.scope("user").unwrap();
        let group = evaluation.builder(evaluation.scope("group").unwrap());
        assert_eq!(evaluation.state(user), ScopeState::Resolved);
        assert_eq!(group.statement(), "select * from groups where owner = $1");
        assert_eq!(group.bind_params().value_at(1), Some(&json!("freda")));
        assert_eq!(stub.executions(), 1);
    }

    #[tokio::test]
    async fn attribute_access_materializes_implicitly() {
        let stub = StubDataSource::new();
        stub.push_rows(vec![json!({ "n": 3 })]);
        let (evaluation, result) = evaluate(
            "{% req counts %}select count(*) as n from t{% endreq %}\
             {% req page %}select {{ counts[0].n }}{% endreq %}",
            json!({}),
            &stub,
        )
        .await;
        result.unwrap();
        let page = evaluation.builder(evaluation.scope("page").unwrap());
        assert_eq!(page.bind_params().value_at(1), Some(&json!(3)));
        assert_eq!(stub.executions(), 1);
    }

    #[tokio::test]
    async fn configuring_after_materialization_is_rejected() {
        let stub = StubDataSource::new();
        let (_, result) = evaluate(
            "{% req user %}select 1{% endreq %}{% set rows = user.value() %}{% set again = user.limit(1) %}",
            json!({}),
            &stub,
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Scope { ref scope, .. } if scope == "user"), "{err}");
    }

    #[tokio::test]
    async fn resolved_scope_executes_again() {
        let stub = StubDataSource::new();
        let (evaluation, result) = evaluate(
            "{% req user %}select 1{% endreq %}{% set a = user.value() %}{% set b = user.value() %}",
            json!({}),
            &stub,
        )
        .await;
        result.unwrap();
        assert_eq!(stub.executions(), 2);
        assert_eq!(evaluation.state(evaluation.scope("user").unwrap()), ScopeState::Resolved);
    }

    #[tokio::test]
    async fn failed_execution_aborts_the_evaluation() {
        let stub = StubDataSource::new();
        stub.push_failure("relation \"users\" does not exist");
        let (evaluation, result) = evaluate(
            "{% req user %}select 1{% endreq %}\
             {% req group %}select {{ user.value()[0].id }}{% endreq %}",
            json!({}),
            &stub,
        )
        .await;
        assert!(matches!(result, Err(Error::Message(_))));
        assert_eq!(evaluation.state(evaluation.scope("user").unwrap()), ScopeState::Failed);
        assert!(evaluation.scope("group").is_none());
    }

    #[tokio::test]
    async fn conditions_and_raised_errors() {
        let stub = StubDataSource::new();
        let source = "{% req q main %}select * from t\
            {% if context.params.id != null and context.params.id > 0 %} where id = {{ context.params.id }}\
            {% elif context.params.strict %}{% error \"ID_REQUIRED\" %}{% endif %}{% endreq %}";

        let (evaluation, result) = evaluate(source, json!({ "id": 4 }), &stub).await;
        result.unwrap();
        let q = evaluation.builder(evaluation.main().unwrap());
        assert_eq!(q.statement(), "select * from t where id = $1");

        let (evaluation, result) = evaluate(source, json!({}), &stub).await;
        result.unwrap();
        assert_eq!(evaluation.builder(evaluation.main().unwrap()).statement(), "select * from t");

        let (_, result) = evaluate(source, json!({ "strict": true }), &stub).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("ID_REQUIRED"), "{err}");
    }

    #[tokio::test]
    async fn methods_on_plain_values_are_rejected() {
        let stub = StubDataSource::new();
        let (_, result) = evaluate("{% set x = context.params.limit(1) %}", json!({}), &stub).await;
        assert!(matches!(result, Err(Error::Template { .. })));
    }
}
