use crate::error::MeshError;
use crate::schema::SourceSchema;
use crate::{Executor, OperationKind};
use async_trait::async_trait;
use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, TypeDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler produces for one source: the schema, an executor for it,
/// and optional context variables and batching preference.
pub struct SourceSetup {
    pub schema: SourceSchema,
    pub executor: Arc<dyn Executor>,
    pub context_variables: HashMap<String, Value>,
    pub batch: Option<bool>,
}

impl SourceSetup {
    pub fn new(schema: SourceSchema, executor: Arc<dyn Executor>) -> Self {
        SourceSetup {
            schema,
            executor,
            context_variables: HashMap::new(),
            batch: None,
        }
    }
}

/// Contract every source handler implements. Invoked once per gateway build.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    async fn get_schema(&self) -> Result<SourceSetup, MeshError>;
}

/// Rewrites one source's schema. Wrap transforms are deferred to the unifier
/// (they need the merged view); no-wrap transforms apply directly to the
/// handler's schema during registry load.
pub trait SchemaTransform: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(&self) -> bool {
        false
    }

    fn transform_schema(&self, schema: SourceSchema) -> Result<SourceSchema, MeshError>;
}

/// Per-source type-merging configuration, passed through to the unifier
/// capability untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    pub type_name: String,
    pub selection_set: String,
    pub field_name: String,
}

/// One configured source as the builder declares it.
pub struct SourceSpec {
    pub name: String,
    pub handler: Arc<dyn SourceHandler>,
    pub transforms: Vec<Arc<dyn SchemaTransform>>,
    pub merge: Option<Vec<MergeConfig>>,
}

impl SourceSpec {
    pub fn new(name: impl Into<String>, handler: Arc<dyn SourceHandler>) -> Self {
        SourceSpec {
            name: name.into(),
            handler,
            transforms: Vec::new(),
            merge: None,
        }
    }
}

/// A loaded source. Created once during registry load, immutable afterwards,
/// owned by the gateway instance that created it.
pub struct RawSource {
    pub name: String,
    pub schema: SourceSchema,
    pub executor: Arc<dyn Executor>,
    /// Transforms left for the unifier to apply. Empty when the registry
    /// already applied them.
    pub transforms: Vec<Arc<dyn SchemaTransform>>,
    pub context_variables: HashMap<String, Value>,
    pub handler: Arc<dyn SourceHandler>,
    pub batch: bool,
    pub merge: Option<Vec<MergeConfig>>,
}

impl std::fmt::Debug for RawSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSource")
            .field("name", &self.name)
            .field("batch", &self.batch)
            .field("transforms", &self.transforms.len())
            .finish_non_exhaustive()
    }
}

/// Prefixes every root field of a source, e.g. `user` -> `users_user`.
/// Useful to avoid root-field collisions between sources.
pub struct PrefixTransform {
    prefix: String,
}

impl PrefixTransform {
    pub fn new(prefix: impl Into<String>) -> Self {
        PrefixTransform {
            prefix: prefix.into(),
        }
    }
}

impl SchemaTransform for PrefixTransform {
    fn name(&self) -> &str {
        "prefix"
    }

    fn transform_schema(&self, schema: SourceSchema) -> Result<SourceSchema, MeshError> {
        let sdl = schema.sdl().to_string();
        let mut document =
            parse_schema::<String>(&sdl).map_err(|e| MeshError::Schema(e.to_string()))?;

        let root_names: Vec<String> = [
            OperationKind::Query,
            OperationKind::Mutation,
            OperationKind::Subscription,
        ]
        .iter()
        .filter_map(|kind| schema.root_type(*kind).map(str::to_string))
        .collect();

        for definition in &mut document.definitions {
            if let Definition::TypeDefinition(TypeDefinition::Object(obj)) = definition {
                if root_names.iter().any(|name| name == &obj.name) {
                    for field in &mut obj.fields {
                        field.name = format!("{}{}", self.prefix, field.name);
                    }
                }
            }
        }

        SourceSchema::parse(&document.to_string())
    }
}
