use crate::error::MeshError;
use crate::schema::SourceSchema;
use crate::source::{SourceHandler, SourceSetup};
use crate::{ExecutionRequest, Executor, ExecutorOutput, OperationKind, SourceResponse};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Source handler for a remote GraphQL endpoint. The schema comes from
/// configured SDL text; execution goes over HTTP.
pub struct GraphQLHandler {
    endpoint: String,
    sdl: String,
    headers: HashMap<String, String>,
    context_variables: HashMap<String, Value>,
    batch: Option<bool>,
}

impl GraphQLHandler {
    pub fn new(endpoint: impl Into<String>, sdl: impl Into<String>) -> Self {
        GraphQLHandler {
            endpoint: endpoint.into(),
            sdl: sdl.into(),
            headers: HashMap::new(),
            context_variables: HashMap::new(),
            batch: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn context_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.context_variables.insert(name.into(), value);
        self
    }

    pub fn batch(mut self, batch: bool) -> Self {
        self.batch = Some(batch);
        self
    }
}

#[async_trait]
impl SourceHandler for GraphQLHandler {
    async fn get_schema(&self) -> Result<SourceSetup, MeshError> {
        let schema = SourceSchema::parse(&self.sdl)?;
        let executor = Arc::new(HttpExecutor::new(&self.endpoint).with_headers(self.headers.clone()));
        Ok(SourceSetup {
            schema,
            executor,
            context_variables: self.context_variables.clone(),
            batch: self.batch,
        })
    }
}

/// Executes requests against a remote endpoint over HTTP POST. Subscriptions
/// are not transportable this way and fail up front.
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
    headers: HashMap<String, String>,
}

impl HttpExecutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpExecutor {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutorOutput, MeshError> {
        if request.operation_kind == OperationKind::Subscription {
            return Err(MeshError::Executor(
                "http executor does not support subscriptions".into(),
            ));
        }

        let body = json!({
            "query": request.query,
            "variables": request.variables,
            "operationName": request.operation_name,
        });

        let mut outgoing = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        for (name, value) in &self.headers {
            outgoing = outgoing.header(name, value);
        }

        let response = outgoing
            .send()
            .await
            .map_err(|e| MeshError::Executor(format!("request to {} failed: {e}", self.endpoint)))?;
        let payload = response.json::<SourceResponse>().await.map_err(|e| {
            MeshError::Executor(format!("invalid response from {}: {e}", self.endpoint))
        })?;

        Ok(ExecutorOutput::Single(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn handler_parses_configured_sdl() {
        let handler = GraphQLHandler::new(
            "http://localhost:4001/graphql",
            "type Query { user(id: ID!): User } type User { id: ID! }",
        )
        .batch(false)
        .context_variable("tenant", json!("acme"));

        let setup = handler.get_schema().await.unwrap();
        assert!(setup
            .schema
            .root_field(OperationKind::Query, "user")
            .is_some());
        assert_eq!(setup.batch, Some(false));
        assert_eq!(setup.context_variables["tenant"], json!("acme"));
    }

    #[tokio::test]
    async fn handler_rejects_invalid_sdl() {
        let handler = GraphQLHandler::new("http://localhost:4001/graphql", "type Query {");
        assert!(handler.get_schema().await.is_err());
    }

    #[tokio::test]
    async fn http_executor_rejects_subscriptions() {
        let executor = HttpExecutor::new("http://localhost:4001/graphql");
        let request = ExecutionRequest::new("subscription { ticks }", OperationKind::Subscription);
        assert!(executor.execute(request).await.is_err());
    }

    #[test]
    fn response_envelope_deserializes() {
        let payload: SourceResponse = serde_json::from_str(
            r#"{"data": {"user": {"id": "1"}}, "errors": [{"message": "partial"}]}"#,
        )
        .unwrap();
        assert_eq!(payload.data["user"]["id"], json!("1"));
        assert_eq!(payload.errors[0].message, "partial");
    }
}
