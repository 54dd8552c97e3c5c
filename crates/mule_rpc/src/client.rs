use serde_json::Value;
use url::Url;

use crate::{Request, Response, RpcError};

/// A caller handle for one service endpoint.
#[derive(Debug, Clone)]
pub struct RpcClient {
    url: Url,
    client: reqwest::Client,
}

impl RpcClient {
    /// Create a client for the service at `url`.
    pub fn connect(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    /// The endpoint this client talks to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Invoke `method` with the given JSON parameter array.
    ///
    /// A reply carrying an `error` field surfaces as [`RpcError::Remote`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = Request {
            method: method.to_owned(),
            params,
        };
        let reply: Response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match reply.error {
            Some(error) => Err(RpcError::Remote(error)),
            None => Ok(reply.result.unwrap_or(Value::Null)),
        }
    }
}
