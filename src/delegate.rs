use crate::error::MeshError;
use crate::logger::Logger;
use crate::schema::FieldMeta;
use crate::unifier::SubschemaConfig;
use crate::{
    ExecutionRequest, ExecutorOutput, GraphQLError, OperationKind, SourceResponse,
};
use graphql_parser::parse_query;
use graphql_parser::query::{Definition, OperationDefinition, Selection};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Maps the collected batch keys to the argument object of one combined call.
pub type ArgsFromKeys = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Maps the combined call's field value back to one value per key, in key
/// order. The default treats an array result as index-aligned with the keys.
pub type ValuesFromResults = Arc<dyn Fn(&Value, &[Value]) -> Vec<Value> + Send + Sync>;

/// Minimal resolve-info describing the invocation site of a field callable.
/// A synthetic one (empty selection, one-level path) stands in when the
/// callable is invoked outside normal field resolution.
#[derive(Clone, Debug)]
pub struct ResolveInfo {
    pub field_name: String,
    pub parent_type: String,
    pub return_type: String,
    pub path: Vec<String>,
    pub selection_text: Option<String>,
    /// Total selections across every field node of the invocation site.
    pub selection_count: usize,
}

impl ResolveInfo {
    pub fn synthetic(parent_type: &str, field: &FieldMeta) -> Self {
        ResolveInfo {
            field_name: field.name.clone(),
            parent_type: parent_type.to_string(),
            return_type: field.return_type.clone(),
            path: vec![field.name.clone()],
            selection_text: None,
            selection_count: 0,
        }
    }
}

/// A caller-supplied selection for a delegated call: literal text, or a
/// function producing the text from the invocation's resolve-info.
#[derive(Clone)]
pub enum SelectionSet {
    Text(String),
    Builder(Arc<dyn Fn(&ResolveInfo) -> String + Send + Sync>),
}

impl SelectionSet {
    pub fn text(selection: impl Into<String>) -> Self {
        SelectionSet::Text(selection.into())
    }

    pub fn resolve(&self, info: &ResolveInfo) -> String {
        match self {
            SelectionSet::Text(text) => text.clone(),
            SelectionSet::Builder(build) => build(info),
        }
    }
}

impl From<&str> for SelectionSet {
    fn from(text: &str) -> Self {
        SelectionSet::Text(text.to_string())
    }
}

/// One delegated field call, built per invocation.
pub struct FieldDelegation {
    pub target: Arc<SubschemaConfig>,
    pub kind: OperationKind,
    pub field: FieldMeta,
    /// Argument values as a JSON object, or `Null` for none.
    pub args: Value,
    /// Validated selection text to graft onto the outgoing field.
    pub selection: Option<String>,
    pub context: Value,
    pub root: Value,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    target: String,
    kind: OperationKind,
    field: String,
}

struct PendingBatch {
    keys: Vec<Value>,
    waiters: Vec<oneshot::Sender<Result<Value, String>>>,
}

/// Decides single vs batched dispatch and forwards execution to the target
/// subschema's executor. Safe to invoke concurrently across fields and
/// requests; the only shared state is the pending-batch map.
pub struct DelegationEngine {
    batches: Mutex<HashMap<BatchKey, PendingBatch>>,
    logger: Logger,
}

impl DelegationEngine {
    pub fn new(logger: Logger) -> Self {
        DelegationEngine {
            batches: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// Single delegation: one outgoing call carrying the caller's arguments,
    /// returning the delegated field's value.
    pub async fn delegate_field(&self, delegation: FieldDelegation) -> Result<Value, MeshError> {
        let request = build_field_request(&delegation);
        let response = self.run_single(&delegation.target, request).await;
        self.extract_field_value(&delegation.target.name, &delegation.field.name, response)
    }

    /// Batched delegation: calls landing in the same collection window for
    /// the same target and field coalesce into exactly one upstream call.
    /// Each caller receives only the value attributed to its own key.
    pub async fn delegate_batched(
        self: &Arc<Self>,
        delegation: FieldDelegation,
        key: Value,
        args_from_keys: ArgsFromKeys,
        values_from_results: Option<ValuesFromResults>,
    ) -> Result<Value, MeshError> {
        let (sender, receiver) = oneshot::channel();
        let batch_key = BatchKey {
            target: delegation.target.name.clone(),
            kind: delegation.kind,
            field: delegation.field.name.clone(),
        };

        let opens_batch = {
            let mut batches = self.batches.lock().expect("batch lock poisoned");
            let batch = batches.entry(batch_key.clone()).or_insert_with(|| PendingBatch {
                keys: Vec::new(),
                waiters: Vec::new(),
            });
            batch.keys.push(key);
            batch.waiters.push(sender);
            batch.keys.len() == 1
        };

        // The first caller of a window schedules the flush; it runs after the
        // current tick so concurrent callers can still join.
        if opens_batch {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                engine
                    .flush(batch_key, delegation, args_from_keys, values_from_results)
                    .await;
            });
        }

        receiver
            .await
            .map_err(|_| MeshError::Executor("batched delegation was dropped".into()))?
            .map_err(MeshError::Executor)
    }

    async fn flush(
        &self,
        batch_key: BatchKey,
        delegation: FieldDelegation,
        args_from_keys: ArgsFromKeys,
        values_from_results: Option<ValuesFromResults>,
    ) {
        let Some(batch) = self.batches.lock().expect("batch lock poisoned").remove(&batch_key)
        else {
            return;
        };
        let PendingBatch { keys, waiters } = batch;
        self.logger.debug(&format!(
            "flushing batch of {} key(s) for {}.{}",
            keys.len(),
            batch_key.target,
            batch_key.field
        ));

        let combined = FieldDelegation {
            args: args_from_keys(&keys),
            ..delegation
        };
        let request = build_field_request(&combined);
        let response = self.run_single(&combined.target, request).await;
        let outcome =
            self.extract_field_value(&combined.target.name, &combined.field.name, response);

        match outcome {
            Ok(field_value) => {
                let values = match &values_from_results {
                    Some(map) => map(&field_value, &keys),
                    None => default_values_from_results(field_value, keys.len()),
                };
                if values.len() != waiters.len() {
                    let message = format!(
                        "batched call produced {} value(s) for {} key(s)",
                        values.len(),
                        waiters.len()
                    );
                    for waiter in waiters {
                        let _ = waiter.send(Err(message.clone()));
                    }
                    return;
                }
                for (waiter, value) in waiters.into_iter().zip(values) {
                    let _ = waiter.send(Ok(value));
                }
            }
            Err(error) => {
                let message = error.to_string();
                for waiter in waiters {
                    let _ = waiter.send(Err(message.clone()));
                }
            }
        }
    }

    /// Delegates one pre-built operation (a planned branch of a unified
    /// request). Transport failures fold into the response error list with
    /// the source attributed, never into a local error.
    pub async fn delegate_operation(
        &self,
        target: &SubschemaConfig,
        request: ExecutionRequest,
    ) -> SourceResponse {
        self.run_single(target, request).await
    }

    /// Delegates a subscription branch; the output may be a stream.
    pub async fn delegate_subscription(
        &self,
        target: &SubschemaConfig,
        request: ExecutionRequest,
    ) -> Result<ExecutorOutput, MeshError> {
        target.executor.execute(request).await
    }

    async fn run_single(
        &self,
        target: &SubschemaConfig,
        request: ExecutionRequest,
    ) -> SourceResponse {
        match target.executor.execute(request).await {
            Ok(ExecutorOutput::Single(response)) => attribute_errors(response, &target.name),
            Ok(ExecutorOutput::Stream(_)) => SourceResponse::from_error(GraphQLError::from_source(
                &target.name,
                "executor returned a stream for a non-subscription request",
            )),
            Err(error) => {
                SourceResponse::from_error(GraphQLError::from_source(&target.name, error.to_string()))
            }
        }
    }

    fn extract_field_value(
        &self,
        source: &str,
        field: &str,
        response: SourceResponse,
    ) -> Result<Value, MeshError> {
        let value = response.data.get(field).cloned();
        if !response.errors.is_empty() {
            let messages: Vec<&str> = response
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect();
            match value {
                Some(value) if !value.is_null() => {
                    // Partial success: hand back the data, surface the rest
                    // through the log only.
                    self.logger.debug(&format!(
                        "delegated call to {source}.{field} returned partial errors: {}",
                        messages.join("; ")
                    ));
                    return Ok(value);
                }
                _ => return Err(MeshError::Executor(messages.join("; "))),
            }
        }
        Ok(value.unwrap_or(Value::Null))
    }
}

fn attribute_errors(mut response: SourceResponse, source: &str) -> SourceResponse {
    for error in &mut response.errors {
        if error.source.is_none() {
            error.source = Some(source.to_string());
        }
    }
    response
}

pub(crate) fn default_values_from_results(field_value: Value, key_count: usize) -> Vec<Value> {
    match field_value {
        Value::Array(mut items) => {
            items.resize(key_count, Value::Null);
            items
        }
        other => vec![other; key_count],
    }
}

/// Builds the outgoing operation for one delegated field. Declared argument
/// types come from the target schema's field metadata, so values travel as
/// variables rather than re-printed literals.
fn build_field_request(delegation: &FieldDelegation) -> ExecutionRequest {
    let mut definitions = Vec::new();
    let mut usages = Vec::new();
    let mut variables = serde_json::Map::new();

    if let Value::Object(args) = &delegation.args {
        for argument in &delegation.field.arguments {
            if let Some(value) = args.get(&argument.name) {
                definitions.push(format!("${}: {}", argument.name, argument.type_text));
                usages.push(format!("{}: ${}", argument.name, argument.name));
                variables.insert(argument.name.clone(), value.clone());
            }
        }
    }

    let header = if definitions.is_empty() {
        delegation.kind.keyword().to_string()
    } else {
        format!("{}({})", delegation.kind.keyword(), definitions.join(", "))
    };
    let field_args = if usages.is_empty() {
        String::new()
    } else {
        format!("({})", usages.join(", "))
    };
    let selection = delegation
        .selection
        .as_deref()
        .map(|s| format!(" {s}"))
        .unwrap_or_default();

    let query = format!(
        "{header} {{ {}{field_args}{selection} }}",
        delegation.field.name
    );

    ExecutionRequest {
        query,
        operation_name: None,
        variables: if variables.is_empty() {
            Value::Null
        } else {
            Value::Object(variables)
        },
        operation_kind: delegation.kind,
        root: delegation.root.clone(),
        context: delegation.context.clone(),
    }
}

/// Validates caller-supplied selection text: it must parse as a bare
/// selection set.
pub(crate) fn normalize_selection(text: &str) -> Result<String, MeshError> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return Err(MeshError::Parse(format!(
            "selection must be a braced selection set, got \"{trimmed}\""
        )));
    }
    parse_query::<String>(trimmed).map_err(|e| MeshError::Parse(e.to_string()))?;
    Ok(trimmed.to_string())
}

/// Ensures the selection requests `__typename` at its top level, so
/// downstream resolvers always get a type-disambiguation hint.
pub(crate) fn with_typename(selection: &str) -> String {
    if selection_has_typename(selection) {
        selection.to_string()
    } else {
        format!("{{ __typename {}", selection.trim_start_matches('{').trim_start())
    }
}

fn selection_has_typename(selection: &str) -> bool {
    let Ok(document) = parse_query::<String>(selection) else {
        return false;
    };
    document.definitions.iter().any(|definition| match definition {
        Definition::Operation(OperationDefinition::SelectionSet(set)) => {
            set.items.iter().any(|item| {
                matches!(item, Selection::Field(field) if field.name == "__typename")
            })
        }
        _ => false,
    })
}
