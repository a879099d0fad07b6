use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    Error,
    config::ProfileConfig,
    data_source::{Column, DataResult, DataSource, DataSourceRegistry},
};

use super::{
    evaluator::Evaluation,
    parser::{self, Method, Node},
};

/// A template compiled once at registration.
#[derive(Debug)]
pub struct CompiledTemplate {
    name: String,
    source: String,
    nodes: Vec<Node>,
}

impl CompiledTemplate {
    pub fn compile(name: impl Into<String>, source: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let source = source.into();
        let nodes = parser::compile(&source).map_err(|message| Error::Compile {
            template: name.clone(),
            message,
        })?;
        Ok(CompiledTemplate {
            name,
            source,
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Row window applied to the `main` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct ExecuteContext {
    pub profile: String,
    /// Exposed to the template as `context.params`.
    pub params: Value,
    pub pagination: Option<Pagination>,
}

impl ExecuteContext {
    pub fn new(profile: impl Into<String>) -> Self {
        ExecuteContext {
            profile: profile.into(),
            params: Value::Object(Default::default()),
            pagination: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_pagination(mut self, limit: i64, offset: i64) -> Self {
        self.pagination = Some(Pagination { limit, offset });
        self
    }
}

/// What schema tooling needs to probe a template's response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    /// Parameters to run the probe with. Without them no probe is run.
    pub example_parameter: Option<Value>,
    /// Name the template was registered under.
    pub template_source: String,
}

/// Compiled templates plus the profiles and data sources they run against.
pub struct TemplateEngine {
    templates: HashMap<String, Arc<CompiledTemplate>>,
    profiles: ProfileConfig,
    sources: DataSourceRegistry,
}

impl TemplateEngine {
    pub fn new(profiles: ProfileConfig, sources: DataSourceRegistry) -> Self {
        TemplateEngine {
            templates: HashMap::new(),
            profiles,
            sources,
        }
    }

    /// Compiles and registers `source` under `name`. Registering a name
    /// twice is a compile error.
    pub fn add_template(&mut self, name: impl Into<String>, source: &str) -> Result<(), Error> {
        let name = name.into();
        if self.templates.contains_key(&name) {
            return Err(Error::Compile {
                template: name,
                message: "template is registered more than once".into(),
            });
        }
        let template = CompiledTemplate::compile(name.clone(), source)?;
        self.templates.insert(name, Arc::new(template));
        Ok(())
    }

    pub fn template(&self, name: &str) -> Option<&CompiledTemplate> {
        self.templates.get(name).map(Arc::as_ref)
    }

    pub fn profiles(&self) -> &ProfileConfig {
        &self.profiles
    }

    pub fn sources(&self) -> &DataSourceRegistry {
        &self.sources
    }

    fn data_source_for(&self, profile: &str) -> Result<Arc<dyn DataSource>, Error> {
        let profile = self
            .profiles
            .get(profile)
            .ok_or_else(|| Error::profile_not_found(profile))?;
        self.sources.get(&profile.source_type)
    }

    /// Evaluates template `name` and executes its `main` request, applying
    /// `context.pagination` to it first.
    ///
    /// Every request referenced while rendering is executed along the way;
    /// the first failure aborts the evaluation.
    pub async fn execute(&self, name: &str, context: ExecuteContext) -> Result<DataResult, Error> {
        let template = self.templates.get(name).cloned().ok_or_else(|| Error::Template {
            template: name.to_string(),
            message: "template not found".into(),
        })?;
        let data_source = self.data_source_for(&context.profile)?;

        let mut evaluation = Evaluation::new(
            template.name(),
            &context.profile,
            data_source,
            json!({ "params": context.params, "profile": context.profile.clone() }),
        );
        evaluation.run(&template.nodes).await?;

        let main = evaluation.main().ok_or_else(|| Error::Template {
            template: template.name().to_string(),
            message: "no `main` request was rendered".into(),
        })?;
        if let Some(Pagination { limit, offset }) = context.pagination {
            evaluation.configure(main, Method::Take, vec![limit.into(), offset.into()])?;
        }
        evaluation.materialize(main).await
    }

    /// Runs the template with its example parameters and a zero-row window
    /// and returns the columns of the result. `None` when there are no
    /// example parameters.
    pub async fn describe(
        &self,
        metadata: &TemplateMetadata,
        profile: &str,
    ) -> Result<Option<Vec<Column>>, Error> {
        let Some(params) = metadata.example_parameter.clone() else {
            return Ok(None);
        };
        let context = ExecuteContext::new(profile)
            .with_params(params)
            .with_pagination(0, 0);
        let result = self.execute(&metadata.template_source, context).await?;
        Ok(Some(result.columns().to_vec()))
    }
}
