use async_trait::async_trait;
use futures::StreamExt;
use meshgate::pipeline::RequestContext;
use meshgate::requester::RequestOutcome;
use meshgate::source::{SourceHandler, SourceSetup, SourceSpec};
use meshgate::unifier::ExtraResolver;
use meshgate::{
    CallOptions, ExecutionRequest, Executor, ExecutorOutput, MeshError, MeshGateway,
    OperationKind, SelectionSet, SourceResponse, SourceSchema,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every request and answers through a fixed response function.
struct MockExecutor {
    calls: Mutex<Vec<ExecutionRequest>>,
    respond: Box<dyn Fn(&ExecutionRequest) -> SourceResponse + Send + Sync>,
}

impl MockExecutor {
    fn new(
        respond: impl Fn(&ExecutionRequest) -> SourceResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(MockExecutor {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutorOutput, MeshError> {
        self.calls.lock().unwrap().push(request.clone());
        let response = (self.respond)(&request);
        Ok(ExecutorOutput::Single(response))
    }
}

struct StaticHandler {
    sdl: String,
    executor: Arc<MockExecutor>,
}

#[async_trait]
impl SourceHandler for StaticHandler {
    async fn get_schema(&self) -> Result<SourceSetup, MeshError> {
        Ok(SourceSetup::new(
            SourceSchema::parse(&self.sdl)?,
            self.executor.clone(),
        ))
    }
}

fn users_source() -> (SourceSpec, Arc<MockExecutor>) {
    let executor = MockExecutor::new(|request| {
        if request.query.contains("usersByIds") {
            let ids = request.variables["ids"].as_array().cloned().unwrap_or_default();
            let users: Vec<Value> = ids
                .iter()
                .map(|id| json!({"id": id, "name": format!("user-{}", id.as_str().unwrap())}))
                .collect();
            SourceResponse::ok(json!({"usersByIds": users}))
        } else {
            SourceResponse::ok(json!({"user": {"id": "1", "name": "ada", "__typename": "User"}}))
        }
    });
    let spec = SourceSpec::new(
        "users",
        Arc::new(StaticHandler {
            sdl: r#"
                type Query {
                    user(id: ID!): User
                    usersByIds(ids: [ID!]!): [User!]!
                }
                type User { id: ID! name: String }
            "#
            .to_string(),
            executor: executor.clone(),
        }),
    );
    (spec, executor)
}

fn products_source() -> (SourceSpec, Arc<MockExecutor>) {
    let executor = MockExecutor::new(|_| {
        SourceResponse::ok(json!({"product": {"sku": "p-1", "price": 100}}))
    });
    let spec = SourceSpec::new(
        "products",
        Arc::new(StaticHandler {
            sdl: r#"
                type Query { product(sku: ID!): Product }
                type Product { sku: ID! price: Int }
            "#
            .to_string(),
            executor: executor.clone(),
        }),
    );
    (spec, executor)
}

async fn two_source_gateway() -> (MeshGateway, Arc<MockExecutor>, Arc<MockExecutor>) {
    let (users, users_executor) = users_source();
    let (products, products_executor) = products_source();
    let gateway = MeshGateway::builder()
        .source(users)
        .source(products)
        .build()
        .await
        .unwrap();
    (gateway, users_executor, products_executor)
}

#[tokio::test]
async fn unified_schema_unions_root_fields_of_every_source() {
    let (gateway, _, _) = two_source_gateway().await;

    let mut names: Vec<_> = gateway
        .schema()
        .schema
        .root_fields(OperationKind::Query)
        .iter()
        .map(|f| f.name.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["product", "user", "usersByIds"]);

    let mut sources = gateway.context().source_names();
    sources.sort();
    assert_eq!(sources, vec!["products", "users"]);
}

#[tokio::test]
async fn build_failure_waits_for_every_source() {
    struct SlowHandler {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SourceHandler for SlowHandler {
        async fn get_schema(&self) -> Result<SourceSetup, MeshError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(SourceSetup::new(
                SourceSchema::parse("type Query { slow: String }")?,
                MockExecutor::new(|_| SourceResponse::default()),
            ))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl SourceHandler for FailingHandler {
        async fn get_schema(&self) -> Result<SourceSetup, MeshError> {
            Err(MeshError::Handler("schema endpoint unreachable".into()))
        }
    }

    let finished = Arc::new(AtomicBool::new(false));
    let error = MeshGateway::builder()
        .source(SourceSpec::new(
            "slow",
            Arc::new(SlowHandler {
                finished: finished.clone(),
            }),
        ))
        .source(SourceSpec::new("bad", Arc::new(FailingHandler)))
        .build()
        .await
        .unwrap_err();

    match error {
        MeshError::BuildFailed { failures } => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("bad:"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The failing source never aborted the slow one.
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn direct_composite_call_requires_a_selection() {
    let (gateway, users_executor, _) = two_source_gateway().await;
    let callable = gateway
        .context()
        .source("users")
        .unwrap()
        .query("user")
        .unwrap()
        .clone();

    let error = callable
        .call(CallOptions::with_args(json!({"id": "1"})))
        .await
        .unwrap_err();
    match error {
        MeshError::Config {
            source_name,
            type_name,
            field,
            ..
        } => {
            assert_eq!(source_name, "users");
            assert_eq!(type_name, "Query");
            assert_eq!(field, "user");
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut options = CallOptions::with_args(json!({"id": "1"}));
    options.selection_set = Some(SelectionSet::text("{ id }"));
    let value = callable.call(options).await.unwrap();
    assert_eq!(value["id"], json!("1"));

    let calls = users_executor.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].query.contains("id"));
    // A direct invocation always requests a type hint too.
    assert!(calls[0].query.contains("__typename"));
}

#[tokio::test]
async fn concurrent_keyed_calls_coalesce_into_one_upstream_call() {
    let (gateway, users_executor, _) = two_source_gateway().await;
    let callable = gateway
        .context()
        .source("users")
        .unwrap()
        .query("usersByIds")
        .unwrap()
        .clone();

    let call_for = |key: &str| {
        let callable = callable.clone();
        let key = json!(key);
        async move {
            let mut options = CallOptions::default();
            options.selection_set = Some(SelectionSet::text("{ id name }"));
            options.key = Some(key);
            options.args_from_keys = Some(Arc::new(|keys| json!({"ids": keys})));
            callable.call(options).await
        }
    };

    let (a, b) = futures::join!(call_for("a"), call_for("b"));

    assert_eq!(users_executor.calls().len(), 1);
    assert_eq!(a.unwrap()["id"], json!("a"));
    assert_eq!(b.unwrap()["id"], json!("b"));
}

#[tokio::test]
async fn requester_maps_a_subscription_into_a_collapsed_stream() {
    struct TickingExecutor;

    #[async_trait]
    impl Executor for TickingExecutor {
        async fn execute(&self, request: ExecutionRequest) -> Result<ExecutorOutput, MeshError> {
            if request.operation_kind != OperationKind::Subscription {
                return Ok(ExecutorOutput::Single(SourceResponse::ok(json!({"ping": "pong"}))));
            }
            let events = vec![
                SourceResponse::ok(json!({"ticks": 1})),
                SourceResponse {
                    data: Value::Null,
                    errors: vec![meshgate::GraphQLError::new("tick source hiccup")],
                },
            ];
            Ok(ExecutorOutput::Stream(futures::stream::iter(events).boxed()))
        }
    }

    struct TickingHandler;

    #[async_trait]
    impl SourceHandler for TickingHandler {
        async fn get_schema(&self) -> Result<SourceSetup, MeshError> {
            Ok(SourceSetup::new(
                SourceSchema::parse(
                    "type Query { ping: String } type Subscription { ticks: Int }",
                )?,
                Arc::new(TickingExecutor),
            ))
        }
    }

    let gateway = MeshGateway::builder()
        .source(SourceSpec::new("ticker", Arc::new(TickingHandler)))
        .build()
        .await
        .unwrap();

    let requester = gateway.requester(HashMap::new());
    let outcome = requester
        .request("subscription { ticks }", None, None)
        .await
        .unwrap();
    let mut stream = match outcome {
        RequestOutcome::Stream(stream) => stream,
        other => panic!("expected a stream, got {other:?}"),
    };

    assert_eq!(stream.next().await.unwrap().unwrap(), json!({"ticks": 1}));
    let error = stream.next().await.unwrap().unwrap_err();
    assert_eq!(error.errors[0].message, "tick source hiccup");
    assert_eq!(stream.next().await.map(|_| ()), None);
}

#[tokio::test]
async fn distinct_context_identities_get_their_own_bound_pipeline() {
    let (users, _) = users_source();
    let gateway = MeshGateway::builder()
        .source(users)
        .extra_type_defs("type Query { whoami: String }")
        .extra_resolver(ExtraResolver {
            type_name: "Query".into(),
            field: "whoami".into(),
            resolver: Arc::new(|_args, context| {
                Box::pin(async move {
                    Ok(context.value("who").cloned().unwrap_or(Value::Null))
                })
            }),
        })
        .build()
        .await
        .unwrap();

    let context_for = |who: &str| {
        let mut values = HashMap::new();
        values.insert("who".to_string(), json!(who));
        Arc::new(RequestContext::new(values))
    };

    let alice = context_for("alice");
    let bob = context_for("bob");

    let first = gateway
        .execute("{ whoami }", None, Some(alice.clone()), None)
        .await
        .unwrap();
    assert_eq!(first.data, json!({"whoami": "alice"}));

    // Distinct identity, even with overlapping keys, never reuses the other
    // context's bound pipeline.
    let second = gateway
        .execute("{ whoami }", None, Some(bob), None)
        .await
        .unwrap();
    assert_eq!(second.data, json!({"whoami": "bob"}));

    // The same identity keeps resolving to its own values.
    let third = gateway
        .execute("{ whoami }", None, Some(alice), None)
        .await
        .unwrap();
    assert_eq!(third.data, json!({"whoami": "alice"}));
}

#[tokio::test]
async fn one_query_fans_out_to_every_owning_source() {
    let (gateway, users_executor, products_executor) = two_source_gateway().await;

    let response = gateway
        .execute(
            r#"query Q($id: ID!, $sku: ID!) {
                user(id: $id) { id name }
                product(sku: $sku) { sku price }
            }"#,
            Some(json!({"id": "1", "sku": "p-1"})),
            None,
            None,
        )
        .await
        .unwrap();

    assert!(response.errors.is_empty());
    assert_eq!(response.data["user"]["name"], json!("ada"));
    assert_eq!(response.data["product"]["price"], json!(100));

    // Each branch only carries the variables it uses.
    let user_calls = users_executor.calls();
    assert_eq!(user_calls.len(), 1);
    assert_eq!(user_calls[0].variables, json!({"id": "1"}));
    let product_calls = products_executor.calls();
    assert_eq!(product_calls.len(), 1);
    assert_eq!(product_calls[0].variables, json!({"sku": "p-1"}));
}

#[tokio::test]
async fn upstream_errors_fold_into_the_merged_response() {
    let failing = MockExecutor::new(|_| {
        SourceResponse::from_error(meshgate::GraphQLError::new("backend down"))
    });
    let spec = SourceSpec::new(
        "flaky",
        Arc::new(StaticHandler {
            sdl: "type Query { flaky: String }".to_string(),
            executor: failing,
        }),
    );
    let (users, _) = users_source();

    let gateway = MeshGateway::builder()
        .source(users)
        .source(spec)
        .build()
        .await
        .unwrap();

    let response = gateway
        .execute(r#"{ user(id: "1") { name } flaky }"#, None, None, None)
        .await
        .unwrap();

    // Partial data survives; the failure is attributed to its source.
    assert_eq!(response.data["user"]["name"], json!("ada"));
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].message, "backend down");
    assert_eq!(response.errors[0].source.as_deref(), Some("flaky"));
}

#[tokio::test]
async fn root_value_reaches_every_delegated_branch() {
    let (gateway, users_executor, _) = two_source_gateway().await;

    let response = gateway
        .execute_with_root(
            r#"{ user(id: "1") { name } }"#,
            None,
            None,
            json!({"tenant": "t1"}),
            None,
        )
        .await
        .unwrap();

    assert!(response.errors.is_empty());
    let calls = users_executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].root, json!({"tenant": "t1"}));
}

#[tokio::test]
async fn one_of_inputs_must_set_exactly_one_field() {
    let executor = MockExecutor::new(|_| {
        SourceResponse::ok(json!({"lookup": {"id": "1", "email": "ada@example.com"}}))
    });
    let spec = SourceSpec::new(
        "users",
        Arc::new(StaticHandler {
            sdl: r#"
                directive @oneOf on INPUT_OBJECT
                type Query { lookup(by: UserBy!): User }
                input UserBy @oneOf { id: ID email: String }
                type User { id: ID email: String }
            "#
            .to_string(),
            executor: executor.clone(),
        }),
    );
    let gateway = MeshGateway::builder().source(spec).build().await.unwrap();

    // Two set fields: rejected before any delegation happens.
    let response = gateway
        .execute(
            r#"{ lookup(by: {id: "1", email: "ada@example.com"}) { id } }"#,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(response.data, Value::Null);
    assert_eq!(response.errors.len(), 1);
    assert!(response.errors[0].message.contains("must set exactly one field"));

    // Zero set fields: also rejected.
    let response = gateway
        .execute("{ lookup(by: {}) { id } }", None, None, None)
        .await
        .unwrap();
    assert_eq!(response.data, Value::Null);
    assert_eq!(response.errors.len(), 1);
    assert!(executor.calls().is_empty());

    // Exactly one set field passes through to the source.
    let response = gateway
        .execute(r#"{ lookup(by: {id: "1"}) { id } }"#, None, None, None)
        .await
        .unwrap();
    assert!(response.errors.is_empty());
    assert_eq!(response.data["lookup"]["id"], json!("1"));
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test]
async fn destroy_notifies_subscribers() {
    let (gateway, _, _) = two_source_gateway().await;
    let mut teardown = gateway.context().pubsub.subscribe(meshgate::pubsub::DESTROY_TOPIC);
    gateway.destroy();
    assert_eq!(teardown.next().await, Some(Value::Null));
}
