use crate::error::MeshError;
use crate::logger::Logger;
use crate::schema::{FieldMeta, SourceSchema};
use crate::sdk::BuiltContext;
use crate::source::{RawSource, SchemaTransform};
use crate::{Executor, OperationKind};
use futures::future::BoxFuture;
use graphql_parser::parse_schema;
use graphql_parser::schema::{Definition, Document, TypeDefinition};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Delegation target for one source. Unification may produce an executable
/// subschema that diverges from the raw source object, so delegation always
/// goes through this config rather than the `RawSource`.
pub struct SubschemaConfig {
    pub name: String,
    pub schema: SourceSchema,
    pub executor: Arc<dyn Executor>,
    pub batch: bool,
}

/// Per-source subschema configs actually used for delegation.
pub struct StitchingInfo {
    pub subschemas: Vec<Arc<SubschemaConfig>>,
}

impl StitchingInfo {
    /// First subschema declaring the given source name.
    pub fn subschema(&self, source_name: &str) -> Option<&Arc<SubschemaConfig>> {
        self.subschemas.iter().find(|s| s.name == source_name)
    }
}

/// Resolver attached through extra type definitions. Receives the resolved
/// field arguments and the built request context (which carries the
/// in-context SDK of every source).
pub type ResolverFn = Arc<
    dyn Fn(Value, Arc<BuiltContext>) -> BoxFuture<'static, Result<Value, MeshError>> + Send + Sync,
>;

#[derive(Clone)]
pub struct ExtraResolver {
    pub type_name: String,
    pub field: String,
    pub resolver: ResolverFn,
}

/// Who resolves a unified root field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldOwner {
    /// Delegated to the named source.
    Source(String),
    /// Handled by the extra resolver at this index.
    Extra(usize),
}

/// The merged schema plus the side tables delegation needs.
pub struct UnifiedSchema {
    pub schema: SourceSchema,
    /// Transformed schema per raw source, keyed by source name. Every raw
    /// source has exactly one entry.
    pub source_map: HashMap<String, SourceSchema>,
    /// Which source (or extra resolver) owns each unified root field.
    pub field_owners: HashMap<(OperationKind, String), FieldOwner>,
    pub stitching_info: Option<StitchingInfo>,
    pub extra_resolvers: Vec<ExtraResolver>,
}

impl UnifiedSchema {
    pub fn owner(&self, kind: OperationKind, field: &str) -> Option<&FieldOwner> {
        self.field_owners.get(&(kind, field.to_string()))
    }
}

impl std::fmt::Debug for UnifiedSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedSchema")
            .field("sources", &self.source_map.keys().collect::<Vec<_>>())
            .field("root_fields", &self.field_owners.len())
            .field("extra_resolvers", &self.extra_resolvers.len())
            .finish_non_exhaustive()
    }
}

/// Input to the unification capability.
pub struct UnifyInput<'a> {
    pub raw_sources: &'a [RawSource],
    pub extra_type_defs: Option<&'a str>,
    pub extra_resolvers: Vec<ExtraResolver>,
    /// Transforms applied to the merged schema after unification.
    pub transforms: &'a [Arc<dyn SchemaTransform>],
}

/// The schema-merging capability. The merge algorithm itself is a
/// collaborator behind this trait; the gateway only depends on its contract.
pub trait SchemaUnifier: Send + Sync {
    fn unify(&self, input: UnifyInput<'_>) -> Result<UnifiedSchema, MeshError>;
}

/// Bundled unifier glue: unions root fields by name across sources, records
/// a field-owner routing table, and re-prints one merged document. First
/// declaring source wins a contested field name; later duplicates are logged.
pub struct BasicUnifier {
    logger: Logger,
}

impl BasicUnifier {
    pub fn new(logger: Logger) -> Self {
        BasicUnifier { logger }
    }
}

impl Default for BasicUnifier {
    fn default() -> Self {
        BasicUnifier::new(Logger::default().child("unifier"))
    }
}

const OPERATION_KINDS: [OperationKind; 3] = [
    OperationKind::Query,
    OperationKind::Mutation,
    OperationKind::Subscription,
];

impl SchemaUnifier for BasicUnifier {
    fn unify(&self, input: UnifyInput<'_>) -> Result<UnifiedSchema, MeshError> {
        let mut seen_names = HashSet::new();
        for source in input.raw_sources {
            // Duplicate names would make name-based subschema resolution
            // silently pick the first config, so they are rejected outright.
            if !seen_names.insert(source.name.as_str()) {
                return Err(MeshError::Unify(format!(
                    "duplicate source name \"{}\"",
                    source.name
                )));
            }
        }

        // Apply each source's remaining transforms, then index by name.
        let mut source_map = HashMap::new();
        for source in input.raw_sources {
            let mut schema = source.schema.clone();
            for transform in &source.transforms {
                schema = transform.transform_schema(schema)?;
            }
            source_map.insert(source.name.clone(), schema);
        }

        let extra_schema = input
            .extra_type_defs
            .map(SourceSchema::parse)
            .transpose()?;

        // Union of root fields, with the routing table built alongside.
        let mut field_owners: HashMap<(OperationKind, String), FieldOwner> = HashMap::new();
        let mut merged_roots: HashMap<OperationKind, Vec<FieldMeta>> = HashMap::new();
        for source in input.raw_sources {
            let schema = &source_map[&source.name];
            for kind in OPERATION_KINDS {
                for field in schema.root_fields(kind) {
                    let key = (kind, field.name.clone());
                    if field_owners.contains_key(&key) {
                        self.logger.debug(&format!(
                            "root field {}.{} from \"{}\" shadowed by an earlier source",
                            kind, field.name, source.name
                        ));
                        continue;
                    }
                    field_owners.insert(key, FieldOwner::Source(source.name.clone()));
                    merged_roots.entry(kind).or_default().push(field.clone());
                }
            }
        }

        if let Some(extra) = &extra_schema {
            for kind in OPERATION_KINDS {
                for field in extra.root_fields(kind) {
                    let root_type = extra.root_type(kind).unwrap_or(kind.default_root_type());
                    let index = input
                        .extra_resolvers
                        .iter()
                        .position(|r| r.type_name == root_type && r.field == field.name)
                        .ok_or_else(|| {
                            MeshError::Unify(format!(
                                "extra field {}.{} has no matching resolver",
                                root_type, field.name
                            ))
                        })?;
                    field_owners.insert((kind, field.name.clone()), FieldOwner::Extra(index));
                    merged_roots.entry(kind).or_default().push(field.clone());
                }
            }
        }

        let ordered: Vec<&SourceSchema> = input
            .raw_sources
            .iter()
            .map(|source| &source_map[&source.name])
            .collect();
        let merged_sdl = print_merged_sdl(&merged_roots, &ordered, extra_schema.as_ref())?;
        // Zero sources and no extra defs print nothing, which the parser
        // rejects as an empty document.
        let mut merged = if merged_sdl.trim().is_empty() {
            SourceSchema::empty()
        } else {
            SourceSchema::parse(&merged_sdl)?
        };
        for transform in input.transforms {
            merged = transform.transform_schema(merged)?;
        }

        let subschemas = input
            .raw_sources
            .iter()
            .map(|source| {
                Arc::new(SubschemaConfig {
                    name: source.name.clone(),
                    schema: source_map[&source.name].clone(),
                    executor: source.executor.clone(),
                    batch: source.batch,
                })
            })
            .collect();

        Ok(UnifiedSchema {
            schema: merged,
            source_map,
            field_owners,
            stitching_info: Some(StitchingInfo { subschemas }),
            extra_resolvers: input.extra_resolvers,
        })
    }
}

/// Prints the merged document: synthesized root types holding the unioned
/// fields, then every non-root definition of every source, deduplicated by
/// name with the first occurrence kept.
fn print_merged_sdl(
    merged_roots: &HashMap<OperationKind, Vec<FieldMeta>>,
    sources: &[&SourceSchema],
    extra_schema: Option<&SourceSchema>,
) -> Result<String, MeshError> {
    let mut sdl = String::new();
    for kind in OPERATION_KINDS {
        let Some(fields) = merged_roots.get(&kind) else {
            continue;
        };
        if fields.is_empty() {
            continue;
        }
        sdl.push_str(&format!("type {} {{\n", kind.default_root_type()));
        for field in fields {
            let args = if field.arguments.is_empty() {
                String::new()
            } else {
                let printed: Vec<String> = field
                    .arguments
                    .iter()
                    .map(|arg| format!("{}: {}", arg.name, arg.type_text))
                    .collect();
                format!("({})", printed.join(", "))
            };
            sdl.push_str(&format!("  {}{}: {}\n", field.name, args, field.type_text));
        }
        sdl.push_str("}\n\n");
    }

    let mut kept = Vec::new();
    let mut kept_names = HashSet::new();
    for schema in sources.iter().copied().chain(extra_schema) {
        let root_names: HashSet<&str> = OPERATION_KINDS
            .iter()
            .filter_map(|kind| schema.root_type(*kind))
            .collect();
        let document = parse_schema::<String>(schema.sdl())
            .map_err(|e| MeshError::Unify(e.to_string()))?;
        for definition in document.definitions {
            match &definition {
                Definition::TypeDefinition(typedef) => {
                    let name = type_definition_name(typedef);
                    if root_names.contains(name) {
                        continue;
                    }
                    if kept_names.insert(name.to_string()) {
                        kept.push(definition);
                    }
                }
                Definition::DirectiveDefinition(directive) => {
                    if kept_names.insert(format!("@{}", directive.name)) {
                        kept.push(definition);
                    }
                }
                Definition::SchemaDefinition(_) | Definition::TypeExtension(_) => {}
            }
        }
    }

    let rest = Document { definitions: kept };
    sdl.push_str(&rest.to_string());
    Ok(sdl)
}

fn type_definition_name<'a>(typedef: &'a TypeDefinition<'_, String>) -> &'a str {
    match typedef {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionRequest, ExecutorOutput, SourceResponse};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct NullExecutor;

    #[async_trait]
    impl Executor for NullExecutor {
        async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutorOutput, MeshError> {
            Ok(ExecutorOutput::Single(SourceResponse::default()))
        }
    }

    fn raw_source(name: &str, sdl: &str) -> RawSource {
        struct Unreachable;
        #[async_trait]
        impl crate::source::SourceHandler for Unreachable {
            async fn get_schema(&self) -> Result<crate::source::SourceSetup, MeshError> {
                unreachable!("not used by unifier tests")
            }
        }
        RawSource {
            name: name.to_string(),
            schema: SourceSchema::parse(sdl).unwrap(),
            executor: Arc::new(NullExecutor),
            transforms: Vec::new(),
            context_variables: HashMap::new(),
            handler: Arc::new(Unreachable),
            batch: true,
            merge: None,
        }
    }

    #[test]
    fn unions_root_fields_and_routes_them() {
        let sources = vec![
            raw_source(
                "users",
                "type Query { user(id: ID!): User } type User { id: ID! }",
            ),
            raw_source(
                "products",
                "type Query { product(id: ID!): Product } type Product { id: ID! }",
            ),
        ];
        let unified = BasicUnifier::default()
            .unify(UnifyInput {
                raw_sources: &sources,
                extra_type_defs: None,
                extra_resolvers: Vec::new(),
                transforms: &[],
            })
            .unwrap();

        let mut names: Vec<_> = unified
            .schema
            .root_fields(OperationKind::Query)
            .iter()
            .map(|f| f.name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["product", "user"]);
        assert_eq!(
            unified.owner(OperationKind::Query, "user"),
            Some(&FieldOwner::Source("users".into()))
        );
        assert_eq!(unified.source_map.len(), 2);
        assert!(unified.schema.is_composite("User"));
        assert!(unified.schema.is_composite("Product"));
    }

    #[test]
    fn unifying_zero_sources_yields_an_empty_schema() {
        let unified = BasicUnifier::default()
            .unify(UnifyInput {
                raw_sources: &[],
                extra_type_defs: None,
                extra_resolvers: Vec::new(),
                transforms: &[],
            })
            .unwrap();
        assert!(unified.schema.sdl().is_empty());
        assert!(unified.schema.root_fields(OperationKind::Query).is_empty());
        assert!(unified.field_owners.is_empty());
    }

    #[test]
    fn first_source_wins_a_contested_field() {
        let sources = vec![
            raw_source("a", "type Query { thing: String }"),
            raw_source("b", "type Query { thing: Int }"),
        ];
        let unified = BasicUnifier::default()
            .unify(UnifyInput {
                raw_sources: &sources,
                extra_type_defs: None,
                extra_resolvers: Vec::new(),
                transforms: &[],
            })
            .unwrap();
        assert_eq!(
            unified.owner(OperationKind::Query, "thing"),
            Some(&FieldOwner::Source("a".into()))
        );
    }

    #[test]
    fn rejects_duplicate_source_names() {
        let sources = vec![
            raw_source("dup", "type Query { a: String }"),
            raw_source("dup", "type Query { b: String }"),
        ];
        let error = BasicUnifier::default()
            .unify(UnifyInput {
                raw_sources: &sources,
                extra_type_defs: None,
                extra_resolvers: Vec::new(),
                transforms: &[],
            })
            .unwrap_err();
        assert!(matches!(error, MeshError::Unify(_)));
    }

    #[test]
    fn extra_fields_need_a_resolver() {
        let sources = vec![raw_source("a", "type Query { a: String }")];
        let error = BasicUnifier::default()
            .unify(UnifyInput {
                raw_sources: &sources,
                extra_type_defs: Some("type Query { combined: String }"),
                extra_resolvers: Vec::new(),
                transforms: &[],
            })
            .unwrap_err();
        assert!(matches!(error, MeshError::Unify(_)));
    }

    #[test]
    fn extra_fields_route_to_their_resolver() {
        let sources = vec![raw_source("a", "type Query { a: String }")];
        let resolver: ResolverFn =
            Arc::new(|_args, _ctx| Box::pin(async { Ok(Value::String("ok".into())) }));
        let unified = BasicUnifier::default()
            .unify(UnifyInput {
                raw_sources: &sources,
                extra_type_defs: Some("type Query { combined: String }"),
                extra_resolvers: vec![ExtraResolver {
                    type_name: "Query".into(),
                    field: "combined".into(),
                    resolver,
                }],
                transforms: &[],
            })
            .unwrap();
        assert_eq!(
            unified.owner(OperationKind::Query, "combined"),
            Some(&FieldOwner::Extra(0))
        );
    }
}
