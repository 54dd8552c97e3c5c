use std::{collections::HashMap, future::Future, sync::Arc};

use axum::{extract::State, routing::post, Json, Router};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::RpcError;

/// An RPC request: a method name and a JSON array of arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// An RPC reply: exactly one of `result` or `error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type Handler<S> =
    Box<dyn Fn(S, Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// An explicit table of RPC methods over a shared service state `S`.
///
/// Dispatch is by exact name. Handlers receive a clone of the state and the
/// raw parameter value; they decode with [`params`] and encode with
/// [`to_result`].
pub struct MethodTable<S> {
    state: S,
    methods: HashMap<&'static str, Handler<S>>,
}

impl<S> MethodTable<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(state: S) -> Self {
        Self {
            state,
            methods: HashMap::new(),
        }
    }

    /// Register `handler` under `name`.
    pub fn register<F, Fut>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(S, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.methods
            .insert(name, Box::new(move |state, params| Box::pin(handler(state, params))));
    }

    /// Execute one request against the table.
    pub async fn dispatch(&self, request: Request) -> Response {
        tracing::debug!("rpc {}", request.method);
        let Some(handler) = self.methods.get(request.method.as_str()) else {
            return Response::from_error(&RpcError::MethodNotFound(request.method));
        };
        match handler(self.state.clone(), request.params).await {
            Ok(result) => Response {
                result: Some(result),
                error: None,
            },
            Err(err) => {
                tracing::warn!("rpc {} failed: {err}", request.method);
                Response::from_error(&err)
            }
        }
    }
}

impl Response {
    fn from_error(err: &RpcError) -> Self {
        Response {
            result: None,
            error: Some(err.to_string()),
        }
    }
}

/// Build the axum router for a method table. Services with extra routes (the
/// cache's file endpoint) merge onto the returned router.
pub fn router<S>(table: MethodTable<S>) -> Router
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", post(handle::<S>))
        .with_state(Arc::new(table))
}

async fn handle<S>(
    State(table): State<Arc<MethodTable<S>>>,
    Json(request): Json<Request>,
) -> Json<Response>
where
    S: Clone + Send + Sync + 'static,
{
    Json(table.dispatch(request).await)
}

/// Decode a handler's parameter tuple from the JSON parameter array.
pub fn params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|err| RpcError::InvalidParams(err.to_string()))
}

/// Encode a handler's return value.
pub fn to_result<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(RpcError::Encode)
}

#[cfg(test)]
mod test {
    use std::{
        future::IntoFuture,
        net::SocketAddr,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    };

    use serde_json::{json, Value};

    use super::{params, router, to_result, MethodTable, Request};
    use crate::{RpcClient, RpcError};

    #[derive(Clone, Default)]
    struct Counter {
        hits: Arc<AtomicU64>,
    }

    fn table() -> MethodTable<Counter> {
        let mut table = MethodTable::new(Counter::default());
        table.register("bump", |state: Counter, raw| async move {
            let (amount,): (u64,) = params(raw)?;
            let total = state.hits.fetch_add(amount, Ordering::SeqCst) + amount;
            to_result(total)
        });
        table.register("echo", |_, raw| async move {
            let (value,): (Value,) = params(raw)?;
            to_result(value)
        });
        table
    }

    #[tokio::test]
    async fn dispatch_runs_the_named_handler() {
        let table = table();
        let reply = table
            .dispatch(Request {
                method: "bump".into(),
                params: json!([3]),
            })
            .await;
        assert_eq!(reply.result, Some(json!(3)));
        assert_eq!(reply.error, None);
    }

    #[tokio::test]
    async fn unknown_method_is_an_error_reply() {
        let reply = table()
            .dispatch(Request {
                method: "nope".into(),
                params: json!([]),
            })
            .await;
        assert!(reply.result.is_none());
        assert!(reply.error.unwrap().contains("unknown method"));
    }

    #[tokio::test]
    async fn malformed_params_are_rejected() {
        let reply = table()
            .dispatch(Request {
                method: "bump".into(),
                params: json!(["not a number"]),
            })
            .await;
        assert!(reply.error.unwrap().contains("invalid parameters"));
    }

    #[tokio::test]
    async fn round_trip_through_http() {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router(table())).into_future());

        let client = RpcClient::connect(format!("http://{addr}").parse().unwrap());
        assert_eq!(client.call("bump", json!([2])).await.unwrap(), json!(2));
        assert_eq!(client.call("bump", json!([5])).await.unwrap(), json!(7));

        // Null values travel unharmed in both directions.
        assert_eq!(
            client.call("echo", json!([null])).await.unwrap(),
            Value::Null
        );

        let err = client.call("missing", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
    }
}
