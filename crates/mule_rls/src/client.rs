use std::collections::BTreeMap;

use mule_rpc::{RpcClient, RpcError, RLS_PORT};
use serde_json::json;
use url::Url;

/// A typed caller for the RLS endpoint.
///
/// Cheap to construct; the per-node cache builds one per operation.
#[derive(Debug, Clone)]
pub struct RlsClient {
    rpc: RpcClient,
}

impl RlsClient {
    /// Create a client for the RLS at `url`.
    pub fn connect(url: Url) -> Self {
        Self {
            rpc: RpcClient::connect(url),
        }
    }

    /// Create a client for `host`, or `host:port`, using the default RLS
    /// port when none is given.
    pub fn for_host(host: &str) -> Result<Self, url::ParseError> {
        let authority = if host.contains(':') {
            host.to_owned()
        } else {
            format!("{host}:{RLS_PORT}")
        };
        Ok(Self::connect(Url::parse(&format!("http://{authority}/"))?))
    }

    /// The endpoint this client talks to.
    pub fn url(&self) -> &Url {
        self.rpc.url()
    }

    /// Liveness probe.
    pub async fn ready(&self) -> Result<bool, RpcError> {
        let value = self.rpc.call("ready", json!([])).await?;
        serde_json::from_value(value).map_err(|err| RpcError::InvalidParams(err.to_string()))
    }

    pub async fn lookup(&self, lfn: &str) -> Result<Vec<String>, RpcError> {
        let value = self.rpc.call("lookup", json!([lfn])).await?;
        serde_json::from_value(value).map_err(|err| RpcError::InvalidParams(err.to_string()))
    }

    pub async fn multilookup(
        &self,
        lfns: Vec<String>,
    ) -> Result<BTreeMap<String, Vec<String>>, RpcError> {
        let value = self.rpc.call("multilookup", json!([lfns])).await?;
        serde_json::from_value(value).map_err(|err| RpcError::InvalidParams(err.to_string()))
    }

    pub async fn add(&self, lfn: &str, pfn: &str) -> Result<(), RpcError> {
        self.rpc.call("add", json!([lfn, pfn])).await?;
        Ok(())
    }

    pub async fn multiadd(&self, pairs: Vec<(String, String)>) -> Result<(), RpcError> {
        self.rpc.call("multiadd", json!([pairs])).await?;
        Ok(())
    }

    pub async fn delete(&self, lfn: &str, pfn: Option<&str>) -> Result<(), RpcError> {
        self.rpc.call("delete", json!([lfn, pfn])).await?;
        Ok(())
    }

    pub async fn multidelete(&self, pairs: Vec<(String, Option<String>)>) -> Result<(), RpcError> {
        self.rpc.call("multidelete", json!([pairs])).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), RpcError> {
        self.rpc.call("clear", json!([])).await?;
        Ok(())
    }
}
