use crate::cache::{InMemoryCache, MeshCache};
use crate::delegate::DelegationEngine;
use crate::error::MeshError;
use crate::logger::Logger;
use crate::pipeline::{
    MeshContextPlugin, OneOfValidationPlugin, ParseCachePlugin, Pipeline, PipelinePlugin,
    RequestContext, SchemaPlugin,
};
use crate::pubsub::{PubSub, DESTROY_TOPIC};
use crate::registry::load_sources;
use crate::requester::Requester;
use crate::sdk::{build_mesh_context, resolve_target, MeshContext};
use crate::source::{RawSource, SchemaTransform, SourceSpec};
use crate::unifier::{
    BasicUnifier, ExtraResolver, SchemaUnifier, SubschemaConfig, UnifiedSchema, UnifyInput,
};
use crate::{ExecutorOutput, SourceResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Assembles a gateway: sources plus the collaborators that may be swapped
/// out. Everything except the sources has a bundled default.
pub struct GatewayBuilder {
    sources: Vec<SourceSpec>,
    unifier: Arc<dyn SchemaUnifier>,
    cache: Arc<dyn MeshCache>,
    pubsub: Arc<PubSub>,
    logger: Logger,
    plugins: Vec<Arc<dyn PipelinePlugin>>,
    extra_type_defs: Option<String>,
    extra_resolvers: Vec<ExtraResolver>,
    merged_schema_transforms: Vec<Arc<dyn SchemaTransform>>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        GatewayBuilder::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        let logger = Logger::default();
        GatewayBuilder {
            sources: Vec::new(),
            unifier: Arc::new(BasicUnifier::new(logger.child("unifier"))),
            cache: Arc::new(InMemoryCache::new()),
            pubsub: Arc::new(PubSub::new()),
            logger,
            plugins: Vec::new(),
            extra_type_defs: None,
            extra_resolvers: Vec::new(),
            merged_schema_transforms: Vec::new(),
        }
    }

    pub fn source(mut self, spec: SourceSpec) -> Self {
        self.sources.push(spec);
        self
    }

    pub fn unifier(mut self, unifier: Arc<dyn SchemaUnifier>) -> Self {
        self.unifier = unifier;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn MeshCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn pubsub(mut self, pubsub: Arc<PubSub>) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Appends a plugin after the bundled ones, so it may override the
    /// schema, the mesh context, and parsing.
    pub fn plugin(mut self, plugin: Arc<dyn PipelinePlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Additional root fields stitched over the sources. Each declared field
    /// must come with a matching resolver.
    pub fn extra_type_defs(mut self, type_defs: impl Into<String>) -> Self {
        self.extra_type_defs = Some(type_defs.into());
        self
    }

    pub fn extra_resolver(mut self, resolver: ExtraResolver) -> Self {
        self.extra_resolvers.push(resolver);
        self
    }

    /// Transform applied to the merged schema after unification.
    pub fn merged_schema_transform(mut self, transform: Arc<dyn SchemaTransform>) -> Self {
        self.merged_schema_transforms.push(transform);
        self
    }

    /// Loads every source, unifies the schemas, and wires the pipeline.
    pub async fn build(self) -> Result<MeshGateway, MeshError> {
        let logger = self.logger;
        logger.info(&format!("building gateway with {} source(s)", self.sources.len()));

        let raw_sources = load_sources(&self.sources, &logger.child("registry")).await?;
        let unified = Arc::new(self.unifier.unify(UnifyInput {
            raw_sources: &raw_sources,
            extra_type_defs: self.extra_type_defs.as_deref(),
            extra_resolvers: self.extra_resolvers,
            transforms: &self.merged_schema_transforms,
        })?);

        let engine = Arc::new(DelegationEngine::new(logger.child("delegate")));
        let mesh = Arc::new(build_mesh_context(
            &raw_sources,
            &unified,
            &engine,
            self.cache,
            self.pubsub.clone(),
            logger.child("context"),
        )?);

        let mut targets: HashMap<String, Arc<SubschemaConfig>> = HashMap::new();
        for source in &raw_sources {
            targets.insert(source.name.clone(), resolve_target(source, &unified)?);
        }

        let mut plugins: Vec<Arc<dyn PipelinePlugin>> = vec![
            Arc::new(SchemaPlugin::new(unified.clone())),
            Arc::new(MeshContextPlugin::new(mesh.clone())),
            Arc::new(ParseCachePlugin::new()),
        ];
        if unified.schema.declares_one_of() {
            plugins.push(Arc::new(OneOfValidationPlugin::new(unified.clone())));
        }
        plugins.extend(self.plugins);

        let pipeline = Arc::new(Pipeline::new(
            plugins,
            engine,
            targets,
            logger.child("pipeline"),
        )?);

        logger.info("gateway ready");
        Ok(MeshGateway {
            unified,
            raw_sources,
            mesh,
            pipeline,
            pubsub: self.pubsub,
            logger,
        })
    }
}

/// A built gateway instance. Cheap to share behind an `Arc`; all per-request
/// state lives inside the pipeline.
pub struct MeshGateway {
    unified: Arc<UnifiedSchema>,
    raw_sources: Vec<RawSource>,
    mesh: Arc<MeshContext>,
    pipeline: Arc<Pipeline>,
    pubsub: Arc<PubSub>,
    logger: Logger,
}

impl std::fmt::Debug for MeshGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshGateway")
            .field("sources", &self.raw_sources)
            .finish_non_exhaustive()
    }
}

impl MeshGateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    pub fn schema(&self) -> &UnifiedSchema {
        &self.unified
    }

    pub fn raw_sources(&self) -> &[RawSource] {
        &self.raw_sources
    }

    /// The shared mesh context carrying the in-context SDK of every source.
    pub fn context(&self) -> &Arc<MeshContext> {
        &self.mesh
    }

    /// Runs a query or mutation against the unified schema.
    pub async fn execute(
        &self,
        query: &str,
        variables: Option<Value>,
        context: Option<Arc<RequestContext>>,
        operation_name: Option<&str>,
    ) -> Result<SourceResponse, MeshError> {
        self.execute_with_root(query, variables, context, Value::Null, operation_name)
            .await
    }

    /// Like [`execute`](Self::execute), with an explicit root value handed to
    /// delegated branches and extra resolvers.
    pub async fn execute_with_root(
        &self,
        query: &str,
        variables: Option<Value>,
        context: Option<Arc<RequestContext>>,
        root: Value,
        operation_name: Option<&str>,
    ) -> Result<SourceResponse, MeshError> {
        self.pipeline
            .execute(query, variables, context, root, operation_name)
            .await
    }

    /// Runs any operation; subscriptions may produce a stream.
    pub async fn subscribe(
        &self,
        query: &str,
        variables: Option<Value>,
        context: Option<Arc<RequestContext>>,
        operation_name: Option<&str>,
    ) -> Result<ExecutorOutput, MeshError> {
        self.subscribe_with_root(query, variables, context, Value::Null, operation_name)
            .await
    }

    /// Like [`subscribe`](Self::subscribe), with an explicit root value.
    pub async fn subscribe_with_root(
        &self,
        query: &str,
        variables: Option<Value>,
        context: Option<Arc<RequestContext>>,
        root: Value,
        operation_name: Option<&str>,
    ) -> Result<ExecutorOutput, MeshError> {
        self.pipeline
            .subscribe(query, variables, context, root, operation_name)
            .await
    }

    /// A data-or-error adapter bound to this gateway with the given global
    /// context values.
    pub fn requester(&self, global_context: HashMap<String, Value>) -> Requester {
        Requester::new(
            self.pipeline.clone(),
            global_context,
            self.logger.child("requester"),
        )
    }

    /// Tears the instance down: notifies destroy subscribers and drops every
    /// memoized per-context pipeline.
    pub fn destroy(&self) {
        self.logger.info("destroying gateway");
        self.pubsub.publish(DESTROY_TOPIC, Value::Null);
        self.pipeline.evict();
    }
}
