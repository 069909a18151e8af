use crate::document::{FragmentInfo, OperationInfo, ParsedDocument, RootField};
use crate::delegate::DelegationEngine;
use crate::error::MeshError;
use crate::logger::Logger;
use crate::sdk::{BuiltContext, MeshContext};
use crate::unifier::{FieldOwner, SubschemaConfig, UnifiedSchema};
use crate::{ExecutorOutput, GraphQLError, OperationKind, SourceResponse};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

/// A validation rule run over every parsed document before execution.
pub type ValidationRule = Arc<dyn Fn(&ParsedDocument) -> Vec<GraphQLError> + Send + Sync>;

/// One link of the execution plugin chain. Plugins are fixed at gateway
/// build time; externally supplied plugins run after the bundled ones and
/// may override the schema, the mesh context, and parsing at each hook.
pub trait PipelinePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Provides the schema the pipeline executes against. The last plugin
    /// returning one wins.
    fn schema(&self) -> Option<Arc<UnifiedSchema>> {
        None
    }

    /// Provides the shared mesh context. The last plugin returning one wins.
    fn mesh_context(&self) -> Option<Arc<MeshContext>> {
        None
    }

    /// Cache-aware parse hook: a `Some` short-circuits parsing.
    fn on_parse(&self, query: &str) -> Option<Result<Arc<ParsedDocument>, MeshError>> {
        let _ = query;
        None
    }

    /// Called after a document was parsed fresh, so caches can populate.
    fn on_parsed(&self, query: &str, document: &Arc<ParsedDocument>) {
        let _ = (query, document);
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        Vec::new()
    }

    /// Extends the per-request context values before the caller's own
    /// context is merged on top.
    fn extend_context(&self, values: &mut HashMap<String, Value>) {
        let _ = values;
    }
}

/// Injects the unified schema into the chain.
pub struct SchemaPlugin {
    schema: Arc<UnifiedSchema>,
}

impl SchemaPlugin {
    pub fn new(schema: Arc<UnifiedSchema>) -> Self {
        SchemaPlugin { schema }
    }
}

impl PipelinePlugin for SchemaPlugin {
    fn name(&self) -> &str {
        "schema"
    }

    fn schema(&self) -> Option<Arc<UnifiedSchema>> {
        Some(self.schema.clone())
    }
}

/// Injects the shared mesh context into every request context.
pub struct MeshContextPlugin {
    mesh: Arc<MeshContext>,
}

impl MeshContextPlugin {
    pub fn new(mesh: Arc<MeshContext>) -> Self {
        MeshContextPlugin { mesh }
    }
}

impl PipelinePlugin for MeshContextPlugin {
    fn name(&self) -> &str {
        "mesh-context"
    }

    fn mesh_context(&self) -> Option<Arc<MeshContext>> {
        Some(self.mesh.clone())
    }
}

/// Validation rule for `@oneOf` input objects: a literal object passed for a
/// oneOf input must set exactly one field. Enabled only when the merged
/// schema declares the directive.
pub struct OneOfValidationPlugin {
    schema: Arc<UnifiedSchema>,
}

impl OneOfValidationPlugin {
    pub fn new(schema: Arc<UnifiedSchema>) -> Self {
        OneOfValidationPlugin { schema }
    }
}

impl PipelinePlugin for OneOfValidationPlugin {
    fn name(&self) -> &str {
        "one-of-validation"
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        let schema = self.schema.clone();
        vec![Arc::new(move |document: &ParsedDocument| {
            let mut errors = Vec::new();
            for operation in &document.operations {
                for field in &operation.root_fields {
                    let Some(meta) = schema.schema.root_field(operation.kind, &field.name) else {
                        continue;
                    };
                    for (arg_name, value) in &field.arguments {
                        let crate::document::ArgValue::Object(entries) = value else {
                            continue;
                        };
                        let Some(argument) = meta.arguments.iter().find(|a| &a.name == arg_name)
                        else {
                            continue;
                        };
                        let input_type = unwrap_type_name(&argument.type_text);
                        if !schema.schema.is_one_of_input(input_type) {
                            continue;
                        }
                        let set = entries
                            .iter()
                            .filter(|(_, v)| !matches!(v, crate::document::ArgValue::Null))
                            .count();
                        if set != 1 {
                            errors.push(GraphQLError::new(format!(
                                "oneOf input \"{input_type}\" for argument \"{arg_name}\" of \
                                 field \"{}\" must set exactly one field, got {set}",
                                field.name
                            )));
                        }
                    }
                }
            }
            errors
        })]
    }
}

fn unwrap_type_name(type_text: &str) -> &str {
    type_text.trim_matches(|c| c == '[' || c == ']' || c == '!')
}

/// Parse-result cache keyed by document text. Writes are idempotent, so a
/// race populating the same key twice is harmless.
#[derive(Default)]
pub struct ParseCachePlugin {
    cache: Mutex<HashMap<String, Arc<ParsedDocument>>>,
}

impl ParseCachePlugin {
    pub fn new() -> Self {
        ParseCachePlugin::default()
    }
}

impl PipelinePlugin for ParseCachePlugin {
    fn name(&self) -> &str {
        "parse-cache"
    }

    fn on_parse(&self, query: &str) -> Option<Result<Arc<ParsedDocument>, MeshError>> {
        self.cache
            .lock()
            .expect("parse cache lock poisoned")
            .get(query)
            .cloned()
            .map(Ok)
    }

    fn on_parsed(&self, query: &str, document: &Arc<ParsedDocument>) {
        self.cache
            .lock()
            .expect("parse cache lock poisoned")
            .insert(query.to_string(), document.clone());
    }
}

/// Caller-supplied per-request context. Memoization is keyed by the identity
/// of the `Arc`, not by value: two value-equal contexts with distinct
/// identities get independent bound pipelines.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub values: HashMap<String, Value>,
}

impl RequestContext {
    pub fn new(values: HashMap<String, Value>) -> Self {
        RequestContext { values }
    }
}

struct BoundPipeline {
    context: Arc<BuiltContext>,
}

#[derive(Default)]
struct BoundTable {
    /// Keyed by the address of the caller's `RequestContext`. The held `Weak`
    /// detects both a dropped context and an address reused by a new one.
    by_context: HashMap<usize, (Weak<RequestContext>, Arc<BoundPipeline>)>,
    no_context: Option<Arc<BoundPipeline>>,
}

/// The request-execution pipeline: a fixed plugin chain around one logical
/// execute/subscribe entry point. Bound pipelines are memoized per caller
/// context identity; the memo is a performance optimization only, and
/// `evict` drops it on gateway teardown.
pub struct Pipeline {
    plugins: Vec<Arc<dyn PipelinePlugin>>,
    rules: Vec<ValidationRule>,
    schema: Arc<UnifiedSchema>,
    mesh: Arc<MeshContext>,
    engine: Arc<DelegationEngine>,
    targets: HashMap<String, Arc<SubschemaConfig>>,
    bound: Mutex<BoundTable>,
    logger: Logger,
}

impl Pipeline {
    pub fn new(
        plugins: Vec<Arc<dyn PipelinePlugin>>,
        engine: Arc<DelegationEngine>,
        targets: HashMap<String, Arc<SubschemaConfig>>,
        logger: Logger,
    ) -> Result<Self, MeshError> {
        let schema = plugins
            .iter()
            .rev()
            .find_map(|plugin| plugin.schema())
            .ok_or_else(|| MeshError::Schema("no pipeline plugin provides a schema".into()))?;
        let mesh = plugins
            .iter()
            .rev()
            .find_map(|plugin| plugin.mesh_context())
            .ok_or_else(|| {
                MeshError::Schema("no pipeline plugin provides a mesh context".into())
            })?;
        let rules = plugins
            .iter()
            .flat_map(|plugin| plugin.validation_rules())
            .collect();

        let names: Vec<&str> = plugins.iter().map(|plugin| plugin.name()).collect();
        logger.debug(&format!("pipeline plugins: {}", names.join(", ")));

        Ok(Pipeline {
            plugins,
            rules,
            schema,
            mesh,
            engine,
            targets,
            bound: Mutex::new(BoundTable::default()),
            logger,
        })
    }

    pub fn schema(&self) -> &Arc<UnifiedSchema> {
        &self.schema
    }

    /// Parses through the plugin chain; the parse cache answers repeats.
    pub fn parse(&self, query: &str) -> Result<Arc<ParsedDocument>, MeshError> {
        for plugin in &self.plugins {
            if let Some(result) = plugin.on_parse(query) {
                return result;
            }
        }
        let document = Arc::new(ParsedDocument::parse(query)?);
        for plugin in &self.plugins {
            plugin.on_parsed(query, &document);
        }
        Ok(document)
    }

    fn run_rules(&self, document: &ParsedDocument) -> Vec<GraphQLError> {
        self.rules.iter().flat_map(|rule| rule(document)).collect()
    }

    /// Returns the bound pipeline for a context identity, building it at most
    /// once per live context.
    fn bind(&self, caller: Option<&Arc<RequestContext>>) -> Arc<BoundPipeline> {
        let mut bound = self.bound.lock().expect("bind lock poisoned");
        let Some(context) = caller else {
            return bound
                .no_context
                .get_or_insert_with(|| self.build_bound(None))
                .clone();
        };

        let key = Arc::as_ptr(context) as usize;
        if let Some((weak, found)) = bound.by_context.get(&key) {
            if weak
                .upgrade()
                .is_some_and(|live| Arc::ptr_eq(&live, context))
            {
                return found.clone();
            }
        }
        bound.by_context.retain(|_, (weak, _)| weak.strong_count() > 0);

        let built = self.build_bound(Some(context));
        bound
            .by_context
            .insert(key, (Arc::downgrade(context), built.clone()));
        built
    }

    fn build_bound(&self, caller: Option<&Arc<RequestContext>>) -> Arc<BoundPipeline> {
        let mut values = HashMap::new();
        for plugin in &self.plugins {
            plugin.extend_context(&mut values);
        }
        if let Some(context) = caller {
            for (name, value) in &context.values {
                values.insert(name.clone(), value.clone());
            }
        }
        Arc::new(BoundPipeline {
            context: Arc::new(BuiltContext::new(self.mesh.clone(), values)),
        })
    }

    /// Drops every memoized bound pipeline. Called on gateway teardown.
    pub fn evict(&self) {
        let mut bound = self.bound.lock().expect("bind lock poisoned");
        bound.by_context.clear();
        bound.no_context = None;
    }

    #[cfg(test)]
    pub(crate) fn bound_count(&self) -> usize {
        let bound = self.bound.lock().expect("bind lock poisoned");
        bound.by_context.len() + usize::from(bound.no_context.is_some())
    }

    pub async fn execute(
        &self,
        query: &str,
        variables: Option<Value>,
        context: Option<Arc<RequestContext>>,
        root: Value,
        operation_name: Option<&str>,
    ) -> Result<SourceResponse, MeshError> {
        let document = self.parse(query)?;
        let errors = self.run_rules(&document);
        if !errors.is_empty() {
            return Ok(SourceResponse {
                data: Value::Null,
                errors,
            });
        }
        let operation = document.operation(operation_name)?;
        if operation.kind == OperationKind::Subscription {
            return Err(MeshError::Executor(
                "subscription operations go through subscribe".into(),
            ));
        }
        let bound = self.bind(context.as_ref());
        self.execute_operation(&document, operation, variables.unwrap_or(Value::Null), root, bound)
            .await
    }

    pub async fn subscribe(
        &self,
        query: &str,
        variables: Option<Value>,
        context: Option<Arc<RequestContext>>,
        root: Value,
        operation_name: Option<&str>,
    ) -> Result<ExecutorOutput, MeshError> {
        let document = self.parse(query)?;
        let errors = self.run_rules(&document);
        if !errors.is_empty() {
            return Ok(ExecutorOutput::Single(SourceResponse {
                data: Value::Null,
                errors,
            }));
        }
        let operation = document.operation(operation_name)?;
        if operation.kind != OperationKind::Subscription {
            // Same entry point, single result.
            let response = self
                .execute_operation(
                    &document,
                    operation,
                    variables.unwrap_or(Value::Null),
                    root,
                    self.bind(context.as_ref()),
                )
                .await?;
            return Ok(ExecutorOutput::Single(response));
        }

        let [field] = operation.root_fields.as_slice() else {
            return Err(MeshError::Validation(vec![GraphQLError::new(
                "a subscription operation must select exactly one root field",
            )]));
        };
        let Some(FieldOwner::Source(source_name)) =
            self.schema.owner(operation.kind, &field.name)
        else {
            return Err(MeshError::Executor(format!(
                "no source found for subscription field \"{}\"",
                field.name
            )));
        };
        let target = self.target(source_name)?;
        let bound = self.bind(context.as_ref());
        let request = branch_request(
            operation,
            &[field],
            &document.fragments,
            &variables.unwrap_or(Value::Null),
            root,
            &bound.context,
        )?;
        self.logger
            .debug(&format!("subscribing through source \"{source_name}\""));
        self.engine.delegate_subscription(&target, request).await
    }

    fn target(&self, source_name: &str) -> Result<Arc<SubschemaConfig>, MeshError> {
        self.targets
            .get(source_name)
            .cloned()
            .ok_or_else(|| MeshError::Executor(format!("unknown source \"{source_name}\"")))
    }

    /// Plans the operation into one branch per owning source (plus extra
    /// resolvers), delegates every branch concurrently, and merges data and
    /// error lists key-wise.
    async fn execute_operation(
        &self,
        document: &ParsedDocument,
        operation: &OperationInfo,
        variables: Value,
        root: Value,
        bound: Arc<BoundPipeline>,
    ) -> Result<SourceResponse, MeshError> {
        let mut merged = SourceResponse::ok(Value::Object(serde_json::Map::new()));

        // Group root fields by owning source, keeping configuration order.
        let mut branch_order: Vec<&str> = Vec::new();
        let mut branches: HashMap<&str, Vec<&RootField>> = HashMap::new();
        let mut extras: Vec<(usize, &RootField)> = Vec::new();
        for field in &operation.root_fields {
            match self.schema.owner(operation.kind, &field.name) {
                Some(FieldOwner::Source(name)) => {
                    let entry = branches.entry(name.as_str()).or_default();
                    if entry.is_empty() {
                        branch_order.push(name.as_str());
                    }
                    entry.push(field);
                }
                Some(FieldOwner::Extra(index)) => extras.push((*index, field)),
                None => merged.errors.push(GraphQLError::new(format!(
                    "no source found for root field \"{}\"",
                    field.name
                ))),
            }
        }

        let source_calls = branch_order.iter().map(|source_name| {
            let fields = &branches[source_name];
            let variables = &variables;
            let root = root.clone();
            let context = &bound.context;
            async move {
                let target = match self.target(source_name) {
                    Ok(target) => target,
                    Err(error) => {
                        return SourceResponse::from_error(GraphQLError::new(error.to_string()));
                    }
                };
                match branch_request(
                    operation,
                    fields,
                    &document.fragments,
                    variables,
                    root,
                    context,
                ) {
                    Ok(request) => self.engine.delegate_operation(&target, request).await,
                    Err(error) => {
                        SourceResponse::from_error(GraphQLError::from_source(
                            source_name,
                            error.to_string(),
                        ))
                    }
                }
            }
        });

        let extra_calls = extras.iter().map(|(index, field)| {
            let resolver = &self.schema.extra_resolvers[*index];
            let args = resolve_arguments(field, &variables);
            let context = bound.context.clone();
            async move {
                (
                    field.response_key.clone(),
                    (resolver.resolver)(args, context).await,
                )
            }
        });

        let (source_results, extra_results) =
            futures::join!(join_all(source_calls), join_all(extra_calls));

        for response in source_results {
            if let Value::Object(fields) = response.data {
                if let Value::Object(data) = &mut merged.data {
                    for (key, value) in fields {
                        data.insert(key, value);
                    }
                }
            }
            merged.errors.extend(response.errors);
        }
        for (key, outcome) in extra_results {
            match outcome {
                Ok(value) => {
                    if let Value::Object(data) = &mut merged.data {
                        data.insert(key, value);
                    }
                }
                Err(error) => merged.errors.push(GraphQLError::new(error.to_string())),
            }
        }

        Ok(merged)
    }
}

/// Resolves a root field's literal arguments against the variable values.
fn resolve_arguments(field: &RootField, variables: &Value) -> Value {
    if field.arguments.is_empty() {
        return Value::Null;
    }
    Value::Object(
        field
            .arguments
            .iter()
            .map(|(name, value)| (name.clone(), value.resolve(variables)))
            .collect(),
    )
}

/// Reassembles one outgoing operation from a subset of root fields: the
/// operation header keeps only the variables the branch uses, the referenced
/// fragments (transitively) are appended, and the variable object is
/// filtered to match.
fn branch_request(
    operation: &OperationInfo,
    fields: &[&RootField],
    fragments: &[FragmentInfo],
    variables: &Value,
    root: Value,
    context: &Arc<BuiltContext>,
) -> Result<crate::ExecutionRequest, MeshError> {
    let mut used_variables: BTreeSet<&str> = BTreeSet::new();
    let mut pending: Vec<&str> = Vec::new();
    let mut included_fragments: BTreeSet<&str> = BTreeSet::new();

    for field in fields {
        used_variables.extend(field.used_variables.iter().map(String::as_str));
        pending.extend(field.fragment_spreads.iter().map(String::as_str));
    }
    while let Some(name) = pending.pop() {
        if !included_fragments.insert(name) {
            continue;
        }
        let fragment = fragments
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| MeshError::Parse(format!("unknown fragment \"{name}\"")))?;
        used_variables.extend(fragment.used_variables.iter().map(String::as_str));
        pending.extend(fragment.fragment_spreads.iter().map(String::as_str));
    }

    let definitions: Vec<String> = operation
        .variable_defs
        .iter()
        .filter(|def| used_variables.contains(def.name.as_str()))
        .map(|def| match &def.default_text {
            Some(default) => format!("${}: {} = {}", def.name, def.type_text, default),
            None => format!("${}: {}", def.name, def.type_text),
        })
        .collect();
    let header = if definitions.is_empty() {
        operation.kind.keyword().to_string()
    } else {
        format!("{}({})", operation.kind.keyword(), definitions.join(", "))
    };

    let body: Vec<&str> = fields.iter().map(|field| field.text.as_str()).collect();
    let mut query = format!("{header} {{ {} }}", body.join(" "));
    for name in &included_fragments {
        let fragment = fragments
            .iter()
            .find(|f| &f.name == name)
            .expect("fragment resolved above");
        query.push(' ');
        query.push_str(&fragment.text);
    }

    let filtered_variables = match variables {
        Value::Object(values) => {
            let kept: serde_json::Map<String, Value> = values
                .iter()
                .filter(|(name, _)| used_variables.contains(name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            if kept.is_empty() {
                Value::Null
            } else {
                Value::Object(kept)
            }
        }
        _ => Value::Null,
    };

    Ok(crate::ExecutionRequest {
        query,
        operation_name: None,
        variables: filtered_variables,
        operation_kind: operation.kind,
        root,
        context: Value::Object(
            context
                .values()
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn branch_keeps_only_used_variables_and_fragments() {
        let document = ParsedDocument::parse(
            r#"query Q($id: ID!, $other: Int) {
                user(id: $id) { ...Core }
                count(limit: $other)
            }
            fragment Core on User { id name }
            fragment Unused on User { id }"#,
        )
        .unwrap();
        let operation = document.operation(None).unwrap();
        let user_field = &operation.root_fields[0];

        let context = Arc::new(BuiltContext::new(
            Arc::new(empty_mesh()),
            HashMap::new(),
        ));
        let request = branch_request(
            operation,
            &[user_field],
            &document.fragments,
            &json!({"id": "1", "other": 5}),
            Value::Null,
            &context,
        )
        .unwrap();

        assert_eq!(
            request.query,
            "query($id: ID!) { user(id: $id) { ...Core } } fragment Core on User { id name }"
        );
        assert_eq!(request.variables, json!({"id": "1"}));
    }

    #[test]
    fn bind_memoizes_per_context_identity_and_evicts() {
        let pipeline = empty_pipeline();

        let mut values = HashMap::new();
        values.insert("who".to_string(), json!("alice"));
        let first = Arc::new(RequestContext::new(values.clone()));
        // Value-equal but a distinct identity.
        let second = Arc::new(RequestContext::new(values));

        let bound_first = pipeline.bind(Some(&first));
        assert!(Arc::ptr_eq(&bound_first, &pipeline.bind(Some(&first))));
        assert!(!Arc::ptr_eq(&bound_first, &pipeline.bind(Some(&second))));
        pipeline.bind(None);
        assert_eq!(pipeline.bound_count(), 3);

        // A dropped context's entry is pruned once another context binds.
        drop(first);
        let third = Arc::new(RequestContext::default());
        pipeline.bind(Some(&third));
        assert_eq!(pipeline.bound_count(), 3);

        pipeline.evict();
        assert_eq!(pipeline.bound_count(), 0);
    }

    fn empty_pipeline() -> Pipeline {
        let mesh = Arc::new(empty_mesh());
        let schema = {
            let unified = empty_unified();
            Arc::new(unified)
        };
        Pipeline::new(
            vec![
                Arc::new(SchemaPlugin::new(schema)),
                Arc::new(MeshContextPlugin::new(mesh)),
            ],
            Arc::new(DelegationEngine::new(Logger::default())),
            HashMap::new(),
            Logger::default(),
        )
        .unwrap()
    }

    fn empty_unified() -> UnifiedSchema {
        use crate::unifier::{BasicUnifier, SchemaUnifier, UnifyInput};

        BasicUnifier::default()
            .unify(UnifyInput {
                raw_sources: &[],
                extra_type_defs: None,
                extra_resolvers: Vec::new(),
                transforms: &[],
            })
            .unwrap()
    }

    fn empty_mesh() -> MeshContext {
        use crate::cache::InMemoryCache;
        use crate::pubsub::PubSub;

        let unified = empty_unified();
        crate::sdk::build_mesh_context(
            &[],
            &unified,
            &Arc::new(DelegationEngine::new(Logger::default())),
            Arc::new(InMemoryCache::new()),
            Arc::new(PubSub::new()),
            Logger::default(),
        )
        .unwrap()
    }
}
