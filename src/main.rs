use clap::Parser;
use meshgate::config::MeshConfig;
use meshgate::gateway::MeshGateway;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "meshgate", about = "GraphQL gateway unifying independent API sources")]
struct Args {
    /// Path to the gateway config file.
    #[arg(short, long, default_value = "meshgate.yaml")]
    config: PathBuf,

    /// Overrides the port from the config file.
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct GraphQLRequest {
    query: String,
    variables: Option<Value>,
    #[serde(rename = "operationName")]
    operation_name: Option<String>,
}

fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

const GRAPHIQL_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - meshgate</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    function graphQLFetcher(graphQLParams) {
      return fetch('/graphql', {
        method: 'post',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<MeshGateway>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(full("Failed to read request body"))
                        .unwrap());
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(graphql_req) => {
                    let outcome = gateway
                        .execute(
                            &graphql_req.query,
                            graphql_req.variables,
                            None,
                            graphql_req.operation_name.as_deref(),
                        )
                        .await;

                    match outcome {
                        Ok(response) => {
                            let json = serde_json::to_string(&response).unwrap_or_default();
                            Response::builder()
                                .header("Content-Type", "application/json")
                                .header("Access-Control-Allow-Origin", "*")
                                .body(full(json))
                                .unwrap_or_else(|_| internal_server_error())
                        }
                        Err(e) => {
                            let error_json = serde_json::to_string(&json!({
                                "errors": [{ "message": e.to_string() }]
                            }))
                            .unwrap_or_default();

                            Response::builder()
                                .header("Content-Type", "application/json")
                                .header("Access-Control-Allow-Origin", "*")
                                .body(full(error_json))
                                .unwrap_or_else(|_| internal_server_error())
                        }
                    }
                }
                Err(e) => Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .header("Access-Control-Allow-Origin", "*")
                    .body(full(format!("Invalid JSON request: {}", e)))
                    .unwrap_or_else(|_| internal_server_error()),
            }
        }

        (&Method::GET, "/graphiql") => Response::builder()
            .header("Content-Type", "text/html")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(GRAPHIQL_HTML))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::FOUND)
            .header("Location", "/graphiql")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::OPTIONS, _) => Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization",
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Access-Control-Allow-Origin", "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

fn internal_server_error() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(full("Internal Server Error"))
        .unwrap()
}

#[derive(Clone)]
struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshgate=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = MeshConfig::load(&args.config)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let specs = config
        .source_specs()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let mut builder = MeshGateway::builder();
    for spec in specs {
        builder = builder.source(spec);
    }
    let gateway = match builder.build().await {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!("failed to build gateway: {e}");
            return Err(std::io::Error::other(e.to_string()));
        }
    };

    let port = args.port.unwrap_or(config.serve.port);
    let host: std::net::IpAddr = config
        .serve
        .hostname
        .parse()
        .map_err(|e| std::io::Error::other(format!("invalid hostname: {e}")))?;
    let addr = SocketAddr::from((host, port));

    let listener = TcpListener::bind(addr).await?;
    info!("gateway listening on http://{addr}");
    info!("GraphiQL UI available at http://{addr}/graphiql");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let gateway_clone = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway_clone.clone();
                handle_request(req, gateway)
            });

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor)
                .serve_connection(io, service)
                .await
            {
                error!("error processing connection: {e}");
            }
        });
    }
}
