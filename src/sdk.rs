use crate::cache::MeshCache;
use crate::delegate::{
    default_values_from_results, normalize_selection, with_typename, ArgsFromKeys,
    DelegationEngine, FieldDelegation, ResolveInfo, SelectionSet, ValuesFromResults,
};
use crate::error::MeshError;
use crate::logger::Logger;
use crate::pubsub::PubSub;
use crate::schema::FieldMeta;
use crate::source::RawSource;
use crate::unifier::{SubschemaConfig, UnifiedSchema};
use crate::OperationKind;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Parameters of one in-context call. Everything is optional beyond what the
/// callable captured at build time.
#[derive(Default)]
pub struct CallOptions {
    /// Root value passed through to the delegated execution.
    pub root: Value,
    /// Field arguments as a JSON object.
    pub args: Value,
    /// Caller context values forwarded to the executor.
    pub context: Value,
    /// Invocation-site resolve info; synthesized when absent.
    pub info: Option<ResolveInfo>,
    /// Sub-selection to graft onto the outgoing field. Required when the
    /// invocation carries no ambient selection and the field returns a
    /// composite type.
    pub selection_set: Option<SelectionSet>,
    /// Batching triple: when `key` and `args_from_keys` are both present the
    /// call joins the current batch window for this field.
    pub key: Option<Value>,
    pub args_from_keys: Option<ArgsFromKeys>,
    pub values_from_results: Option<ValuesFromResults>,
}

impl CallOptions {
    pub fn with_args(args: Value) -> Self {
        CallOptions {
            args,
            ..CallOptions::default()
        }
    }
}

/// One entry of the in-context SDK: a callable bound to a (source, root
/// type, field) triple. Stateless beyond the captured constants; invoked
/// many times concurrently.
pub struct FieldCallable {
    source: String,
    parent_type: String,
    kind: OperationKind,
    field: FieldMeta,
    /// Whether the declared return type needs a selection.
    composite: bool,
    target: Arc<SubschemaConfig>,
    context_variables: HashMap<String, Value>,
    engine: Arc<DelegationEngine>,
}

impl FieldCallable {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn field_name(&self) -> &str {
        &self.field.name
    }

    pub fn operation_kind(&self) -> OperationKind {
        self.kind
    }

    pub fn return_type(&self) -> &str {
        &self.field.return_type
    }

    pub fn is_composite(&self) -> bool {
        self.composite
    }

    /// Invokes the field against its source through the delegation engine.
    ///
    /// A direct invocation (no ambient selection in `info`) of a
    /// composite-return field must supply `selection_set`; the grafted
    /// selection is then patched to request `__typename` as well.
    pub async fn call(&self, options: CallOptions) -> Result<Value, MeshError> {
        let info = options
            .info
            .unwrap_or_else(|| ResolveInfo::synthetic(&self.parent_type, &self.field));
        let direct = info.selection_count == 0;

        let selection = match &options.selection_set {
            Some(set) => {
                let text = normalize_selection(&set.resolve(&info))?;
                Some(if direct { with_typename(&text) } else { text })
            }
            None => info.selection_text.clone(),
        };

        if self.composite && selection.is_none() {
            return Err(MeshError::Config {
                source_name: self.source.clone(),
                type_name: self.parent_type.clone(),
                field: self.field.name.clone(),
                reason: "selectionSet is required when calling a composite-return field with no \
                         ambient selection"
                    .into(),
            });
        }

        let delegation = FieldDelegation {
            target: self.target.clone(),
            kind: self.kind,
            field: self.field.clone(),
            args: options.args,
            selection,
            context: merge_context(&self.context_variables, options.context),
            root: options.root,
        };

        match (options.key, options.args_from_keys) {
            (Some(key), Some(args_from_keys)) if self.target.batch => {
                self.engine
                    .delegate_batched(delegation, key, args_from_keys, options.values_from_results)
                    .await
            }
            // Batching disabled on the source: same contract, one key per call.
            (Some(key), Some(args_from_keys)) => {
                let keys = vec![key];
                let mut single = delegation;
                single.args = args_from_keys(&keys);
                let field_value = self.engine.delegate_field(single).await?;
                let mut values = match &options.values_from_results {
                    Some(map) => map(&field_value, &keys),
                    None => default_values_from_results(field_value, 1),
                };
                Ok(values.drain(..).next().unwrap_or(Value::Null))
            }
            _ => self.engine.delegate_field(delegation).await,
        }
    }
}

fn merge_context(context_variables: &HashMap<String, Value>, context: Value) -> Value {
    if context_variables.is_empty() {
        return context;
    }
    let mut merged = serde_json::Map::new();
    for (key, value) in context_variables {
        merged.insert(key.clone(), value.clone());
    }
    if let Value::Object(values) = context {
        for (key, value) in values {
            merged.insert(key, value);
        }
    }
    Value::Object(merged)
}

/// The per-operation callable tables of one source.
#[derive(Default)]
pub struct SourceSdk {
    tables: HashMap<OperationKind, HashMap<String, Arc<FieldCallable>>>,
}

impl SourceSdk {
    pub fn callable(&self, kind: OperationKind, field: &str) -> Option<&Arc<FieldCallable>> {
        self.tables.get(&kind)?.get(field)
    }

    pub fn query(&self, field: &str) -> Option<&Arc<FieldCallable>> {
        self.callable(OperationKind::Query, field)
    }

    pub fn mutation(&self, field: &str) -> Option<&Arc<FieldCallable>> {
        self.callable(OperationKind::Mutation, field)
    }

    pub fn subscription(&self, field: &str) -> Option<&Arc<FieldCallable>> {
        self.callable(OperationKind::Subscription, field)
    }

    pub fn field_names(&self, kind: OperationKind) -> Vec<&str> {
        self.tables
            .get(&kind)
            .map(|table| table.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn insert(&mut self, kind: OperationKind, name: String, callable: Arc<FieldCallable>) {
        self.tables.entry(kind).or_default().insert(name, callable);
    }
}

/// The shared mesh context: one SDK surface per source plus the shared
/// singletons. Built once per gateway, read-only afterwards, merged into
/// every per-request context.
pub struct MeshContext {
    sources: HashMap<String, SourceSdk>,
    pub cache: Arc<dyn MeshCache>,
    pub pubsub: Arc<PubSub>,
    pub logger: Logger,
}

impl MeshContext {
    pub fn source(&self, name: &str) -> Option<&SourceSdk> {
        self.sources.get(name)
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }
}

/// A genuine built request context: the mesh context plus the merged
/// caller-supplied values. Only the pipeline constructs one, which is what
/// distinguishes it from an arbitrary caller-supplied mapping.
pub struct BuiltContext {
    mesh: Arc<MeshContext>,
    values: HashMap<String, Value>,
}

impl BuiltContext {
    pub(crate) fn new(mesh: Arc<MeshContext>, values: HashMap<String, Value>) -> Self {
        BuiltContext { mesh, values }
    }

    pub fn mesh(&self) -> &MeshContext {
        &self.mesh
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

const OPERATION_KINDS: [OperationKind; 3] = [
    OperationKind::Query,
    OperationKind::Mutation,
    OperationKind::Subscription,
];

/// Resolves the delegation target for a source: the stitching-info subschema
/// matching the source's name when stitching info exists (unification may
/// have produced a divergent executable subschema), otherwise the raw source
/// itself.
pub(crate) fn resolve_target(
    source: &RawSource,
    unified: &UnifiedSchema,
) -> Result<Arc<SubschemaConfig>, MeshError> {
    match &unified.stitching_info {
        Some(info) => {
            info.subschema(&source.name)
                .cloned()
                .ok_or_else(|| MeshError::Config {
                    source_name: source.name.clone(),
                    type_name: "*".into(),
                    field: "*".into(),
                    reason: "stitching info has no subschema config for this source".into(),
                })
        }
        None => Ok(Arc::new(SubschemaConfig {
            name: source.name.clone(),
            schema: source.schema.clone(),
            executor: source.executor.clone(),
            batch: source.batch,
        })),
    }
}

/// Builds the in-context SDK for every source: resolves each source's
/// delegation target (through stitching info when present), then enumerates
/// one callable per root field of the source's transformed schema.
pub fn build_mesh_context(
    raw_sources: &[RawSource],
    unified: &UnifiedSchema,
    engine: &Arc<DelegationEngine>,
    cache: Arc<dyn MeshCache>,
    pubsub: Arc<PubSub>,
    logger: Logger,
) -> Result<MeshContext, MeshError> {
    let mut sources = HashMap::new();

    for source in raw_sources {
        let target = resolve_target(source, unified)?;

        let transformed = unified.source_map.get(&source.name).ok_or_else(|| {
            MeshError::Config {
                source_name: source.name.clone(),
                type_name: "*".into(),
                field: "*".into(),
                reason: "source has no entry in the unified source map".into(),
            }
        })?;

        let mut sdk = SourceSdk::default();
        for kind in OPERATION_KINDS {
            let Some(root_type) = transformed.root_type(kind) else {
                continue;
            };
            for field in transformed.root_fields(kind) {
                let callable = Arc::new(FieldCallable {
                    source: source.name.clone(),
                    parent_type: root_type.to_string(),
                    kind,
                    field: field.clone(),
                    composite: transformed.is_composite(&field.return_type),
                    target: target.clone(),
                    context_variables: source.context_variables.clone(),
                    engine: engine.clone(),
                });
                sdk.insert(kind, field.name.clone(), callable);
            }
        }
        sources.insert(source.name.clone(), sdk);
    }

    Ok(MeshContext {
        sources,
        cache,
        pubsub,
        logger,
    })
}
