pub mod cache;
pub mod config;
pub mod delegate;
pub mod document;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod logger;
pub mod pipeline;
pub mod pubsub;
pub mod registry;
pub mod requester;
pub mod schema;
pub mod sdk;
pub mod source;
pub mod unifier;

pub use cache::{InMemoryCache, MeshCache};
pub use delegate::{DelegationEngine, ResolveInfo, SelectionSet};
pub use error::{AggregateError, MeshError};
pub use gateway::{GatewayBuilder, MeshGateway};
pub use handlers::{GraphQLHandler, HttpExecutor};
pub use logger::Logger;
pub use pipeline::{Pipeline, PipelinePlugin, RequestContext};
pub use pubsub::PubSub;
pub use requester::{RequestOutcome, Requester};
pub use schema::SourceSchema;
pub use sdk::{CallOptions, FieldCallable, MeshContext};
pub use source::{RawSource, SchemaTransform, SourceHandler, SourceSetup};
pub use unifier::{BasicUnifier, SchemaUnifier, UnifiedSchema, UnifyInput};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The three GraphQL root operation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    /// Keyword used when printing an operation of this kind.
    pub fn keyword(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }

    /// Root type name used when a schema has no explicit `schema { .. }` block.
    pub fn default_root_type(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One entry of a GraphQL response error list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    /// Name of the source the error came from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_source(source: &str, message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            source: Some(source.to_string()),
        }
    }
}

/// A GraphQL execution result: partial data plus an error list, never an
/// exception. Mirrors the wire format the gateway both consumes and serves.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceResponse {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl SourceResponse {
    pub fn ok(data: Value) -> Self {
        SourceResponse {
            data,
            errors: Vec::new(),
        }
    }

    pub fn from_error(error: GraphQLError) -> Self {
        SourceResponse {
            data: Value::Null,
            errors: vec![error],
        }
    }
}

/// A request forwarded to a source executor.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub query: String,
    pub operation_name: Option<String>,
    /// Variable values as a JSON object, or `Null` when there are none.
    pub variables: Value,
    pub operation_kind: OperationKind,
    /// Root value passed through from the caller; executors may ignore it.
    pub root: Value,
    /// Context values visible to the executor (request context merged with
    /// the source's configured context variables).
    pub context: Value,
}

impl ExecutionRequest {
    pub fn new(query: impl Into<String>, operation_kind: OperationKind) -> Self {
        ExecutionRequest {
            query: query.into(),
            operation_name: None,
            variables: Value::Null,
            operation_kind,
            root: Value::Null,
            context: Value::Null,
        }
    }
}

/// Stream of results produced by a subscription executor.
pub type ResponseStream = BoxStream<'static, SourceResponse>;

/// What an executor produces: one result, or a pull-driven stream of them.
pub enum ExecutorOutput {
    Single(SourceResponse),
    Stream(ResponseStream),
}

impl fmt::Debug for ExecutorOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorOutput::Single(response) => f.debug_tuple("Single").field(response).finish(),
            ExecutorOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Executes requests against one source. Used for direct, delegated and
/// batched calls alike.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutorOutput, MeshError>;
}
