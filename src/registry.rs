use crate::error::MeshError;
use crate::logger::Logger;
use crate::source::{RawSource, SourceSpec};
use futures::future::join_all;

/// Loads every configured source concurrently. A failing source never
/// short-circuits the others: all outcomes are collected first so the caller
/// sees every source's diagnostics, then a single aggregate error is
/// reported if anything failed. Results keep configuration order.
pub async fn load_sources(specs: &[SourceSpec], logger: &Logger) -> Result<Vec<RawSource>, MeshError> {
    let loads = specs.iter().map(|spec| {
        let source_logger = logger.child(&spec.name);
        async move {
            match load_source(spec).await {
                Ok(source) => {
                    source_logger.debug("source loaded");
                    Ok(source)
                }
                Err(error) => {
                    source_logger.error(&format!("failed to load source: {error}"));
                    Err(format!("{}: {}", spec.name, error))
                }
            }
        }
    });

    let mut sources = Vec::new();
    let mut failures = Vec::new();
    for result in join_all(loads).await {
        match result {
            Ok(source) => sources.push(source),
            Err(message) => failures.push(message),
        }
    }

    if failures.is_empty() {
        Ok(sources)
    } else {
        Err(MeshError::BuildFailed { failures })
    }
}

async fn load_source(spec: &SourceSpec) -> Result<RawSource, MeshError> {
    let setup = spec.handler.get_schema().await?;

    let has_wrap = spec.transforms.iter().any(|t| t.wrap());
    let has_no_wrap = spec.transforms.iter().any(|t| !t.wrap());

    // No-wrap transforms apply directly to the handler's schema, but only
    // when no wrap transform needs the full ordered list during unification.
    let (schema, transforms) = if has_no_wrap && !has_wrap {
        let mut schema = setup.schema;
        for transform in &spec.transforms {
            schema = transform.transform_schema(schema)?;
        }
        (schema, Vec::new())
    } else {
        (setup.schema, spec.transforms.clone())
    };

    Ok(RawSource {
        name: spec.name.clone(),
        schema,
        executor: setup.executor,
        transforms,
        context_variables: setup.context_variables,
        handler: spec.handler.clone(),
        batch: setup.batch.unwrap_or(true),
        merge: spec.merge.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SourceSchema;
    use crate::source::{PrefixTransform, SourceHandler, SourceSetup};
    use crate::{
        ExecutionRequest, Executor, ExecutorOutput, OperationKind, SourceResponse,
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullExecutor;

    #[async_trait]
    impl Executor for NullExecutor {
        async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutorOutput, MeshError> {
            Ok(ExecutorOutput::Single(SourceResponse::default()))
        }
    }

    struct StaticHandler {
        sdl: &'static str,
    }

    #[async_trait]
    impl SourceHandler for StaticHandler {
        async fn get_schema(&self) -> Result<SourceSetup, MeshError> {
            Ok(SourceSetup::new(
                SourceSchema::parse(self.sdl)?,
                Arc::new(NullExecutor),
            ))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl SourceHandler for FailingHandler {
        async fn get_schema(&self) -> Result<SourceSetup, MeshError> {
            Err(MeshError::Handler("boom".into()))
        }
    }

    #[tokio::test]
    async fn applies_no_wrap_transforms_immediately() {
        let mut spec = SourceSpec::new(
            "users",
            Arc::new(StaticHandler {
                sdl: "type Query { user: String }",
            }),
        );
        spec.transforms.push(Arc::new(PrefixTransform::new("u_")));

        let sources = load_sources(&[spec], &Logger::default()).await.unwrap();
        assert!(sources[0]
            .schema
            .root_field(OperationKind::Query, "u_user")
            .is_some());
        assert!(sources[0].transforms.is_empty());
    }

    #[tokio::test]
    async fn collects_every_failure() {
        let specs = vec![
            SourceSpec::new("one", Arc::new(FailingHandler)),
            SourceSpec::new(
                "two",
                Arc::new(StaticHandler {
                    sdl: "type Query { ping: String }",
                }),
            ),
            SourceSpec::new("three", Arc::new(FailingHandler)),
        ];

        let error = load_sources(&specs, &Logger::default()).await.unwrap_err();
        match error {
            MeshError::BuildFailed { failures } => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("one:"));
                assert!(failures[1].starts_with("three:"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
