use crate::error::AggregateError;
use crate::logger::Logger;
use crate::pipeline::{Pipeline, RequestContext};
use crate::{ExecutorOutput, OperationKind, SourceResponse};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What a collapsed request produces: the data value, or for subscriptions a
/// stream of per-event collapsed results.
pub enum RequestOutcome {
    Data(Value),
    Stream(BoxStream<'static, Result<Value, AggregateError>>),
}

impl std::fmt::Debug for RequestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestOutcome::Data(value) => f.debug_tuple("Data").field(value).finish(),
            RequestOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Data-or-error adapter over the pipeline, for callers that want a plain
/// value instead of the GraphQL data-plus-errors envelope. Any error entry
/// in a result fails that result as one `AggregateError`.
pub struct Requester {
    pipeline: Arc<Pipeline>,
    global_context: HashMap<String, Value>,
    /// Operation kind per document text, so repeated documents skip the
    /// dispatch parse.
    kinds: Mutex<HashMap<String, OperationKind>>,
    logger: Logger,
}

impl Requester {
    pub fn new(
        pipeline: Arc<Pipeline>,
        global_context: HashMap<String, Value>,
        logger: Logger,
    ) -> Self {
        Requester {
            pipeline,
            global_context,
            kinds: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// Runs one document. Queries and mutations collapse to their data value;
    /// a subscription yields a stream collapsing each event the same way.
    /// Caller context values override the requester's global ones per key.
    pub async fn request(
        &self,
        document: &str,
        variables: Option<Value>,
        context: Option<HashMap<String, Value>>,
    ) -> Result<RequestOutcome, AggregateError> {
        let kind = self.operation_kind(document)?;
        let bound_context = Some(Arc::new(RequestContext::new(self.merged_context(context))));

        if kind != OperationKind::Subscription {
            let response = self
                .pipeline
                .execute(document, variables, bound_context, Value::Null, None)
                .await
                .map_err(|error| AggregateError::from_message(error.to_string()))?;
            return collapse(response).map(RequestOutcome::Data);
        }

        self.logger.debug("dispatching subscription request");
        let output = self
            .pipeline
            .subscribe(document, variables, bound_context, Value::Null, None)
            .await
            .map_err(|error| AggregateError::from_message(error.to_string()))?;
        match output {
            ExecutorOutput::Single(response) => collapse(response).map(RequestOutcome::Data),
            ExecutorOutput::Stream(stream) => {
                Ok(RequestOutcome::Stream(stream.map(collapse).boxed()))
            }
        }
    }

    fn merged_context(
        &self,
        overrides: Option<HashMap<String, Value>>,
    ) -> HashMap<String, Value> {
        let mut merged = self.global_context.clone();
        if let Some(overrides) = overrides {
            merged.extend(overrides);
        }
        merged
    }

    fn operation_kind(&self, document: &str) -> Result<OperationKind, AggregateError> {
        if let Some(kind) = self.kinds.lock().expect("kind memo lock poisoned").get(document) {
            return Ok(*kind);
        }
        let parsed = self
            .pipeline
            .parse(document)
            .map_err(|error| AggregateError::from_message(error.to_string()))?;
        let kind = parsed
            .operation(None)
            .map_err(|error| AggregateError::from_message(error.to_string()))?
            .kind;
        self.kinds
            .lock()
            .expect("kind memo lock poisoned")
            .insert(document.to_string(), kind);
        Ok(kind)
    }
}

fn collapse(response: SourceResponse) -> Result<Value, AggregateError> {
    if response.errors.is_empty() {
        Ok(response.data)
    } else {
        Err(AggregateError::new(response.errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GraphQLError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn collapse_keeps_clean_data() {
        let value = collapse(SourceResponse::ok(json!({"a": 1}))).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn collapse_fails_on_any_error() {
        let response = SourceResponse {
            data: json!({"a": 1}),
            errors: vec![GraphQLError::new("boom")],
        };
        let error = collapse(response).unwrap_err();
        assert_eq!(error.errors.len(), 1);
        assert_eq!(error.errors[0].message, "boom");
    }
}
