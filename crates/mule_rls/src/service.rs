use std::{collections::BTreeMap, path::Path};

use mule_rpc::{params, to_result, MethodTable, RpcError};
use mule_store::{run_blocking_task, Cancelled, RlsDb, StoreError};

/// The RLS service: thin, transactional operations over [`RlsDb`].
///
/// The handle is cheap to clone and shared by every RPC request.
#[derive(Clone)]
pub struct Rls {
    db: RlsDb,
}

/// Errors surfaced by RLS operations.
#[derive(Debug, thiserror::Error)]
pub enum RlsError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<Cancelled> for RlsError {
    fn from(_: Cancelled) -> Self {
        RlsError::Cancelled
    }
}

impl Rls {
    /// Open the service state under `<home>/var/rls/`.
    pub fn open(home: &Path) -> Result<Self, RlsError> {
        Ok(Self {
            db: RlsDb::open(home)?,
        })
    }

    /// Start the periodic store checkpoint task.
    pub fn spawn_checkpointer(&self) -> tokio::task::JoinHandle<()> {
        self.db.spawn_checkpointer()
    }

    /// Flush the store before shutdown.
    pub fn close(&self) {
        tracing::info!("shutting down RLS");
        self.db.close();
    }

    pub async fn lookup(&self, lfn: &str) -> Result<Vec<String>, RlsError> {
        tracing::debug!("lookup {lfn}");
        let db = self.db.clone();
        let lfn = lfn.to_owned();
        run_blocking_task(move || Ok(db.lookup(&lfn)?)).await
    }

    pub async fn multilookup(
        &self,
        lfns: Vec<String>,
    ) -> Result<BTreeMap<String, Vec<String>>, RlsError> {
        tracing::debug!("multilookup {}", lfns.len());
        let db = self.db.clone();
        run_blocking_task(move || Ok(db.multilookup(&lfns)?)).await
    }

    pub async fn add(&self, lfn: &str, pfn: &str) -> Result<(), RlsError> {
        tracing::debug!("add {lfn} {pfn}");
        let db = self.db.clone();
        let lfn = lfn.to_owned();
        let pfn = pfn.to_owned();
        run_blocking_task(move || Ok(db.add(&lfn, &pfn)?)).await
    }

    pub async fn multiadd(&self, pairs: Vec<(String, String)>) -> Result<(), RlsError> {
        tracing::debug!("multiadd {}", pairs.len());
        let db = self.db.clone();
        run_blocking_task(move || Ok(db.multiadd(&pairs)?)).await
    }

    pub async fn delete(&self, lfn: &str, pfn: Option<&str>) -> Result<(), RlsError> {
        tracing::debug!("delete {lfn} {pfn:?}");
        let db = self.db.clone();
        let lfn = lfn.to_owned();
        let pfn = pfn.map(str::to_owned);
        run_blocking_task(move || Ok(db.delete(&lfn, pfn.as_deref())?)).await
    }

    pub async fn multidelete(&self, pairs: Vec<(String, Option<String>)>) -> Result<(), RlsError> {
        tracing::debug!("multidelete {}", pairs.len());
        let db = self.db.clone();
        run_blocking_task(move || Ok(db.multidelete(&pairs)?)).await
    }

    pub async fn clear(&self) -> Result<(), RlsError> {
        tracing::debug!("clear");
        let db = self.db.clone();
        run_blocking_task(move || Ok(db.clear()?)).await
    }

    /// Build the RPC router exposing every service method.
    pub fn router(&self) -> axum::Router {
        let mut table = MethodTable::new(self.clone());
        table.register("lookup", |rls: Rls, raw| async move {
            let (lfn,): (String,) = params(raw)?;
            to_result(rls.lookup(&lfn).await.map_err(RpcError::handler)?)
        });
        table.register("multilookup", |rls: Rls, raw| async move {
            let (lfns,): (Vec<String>,) = params(raw)?;
            to_result(rls.multilookup(lfns).await.map_err(RpcError::handler)?)
        });
        table.register("add", |rls: Rls, raw| async move {
            let (lfn, pfn): (String, String) = params(raw)?;
            to_result(rls.add(&lfn, &pfn).await.map_err(RpcError::handler)?)
        });
        table.register("multiadd", |rls: Rls, raw| async move {
            let (pairs,): (Vec<(String, String)>,) = params(raw)?;
            to_result(rls.multiadd(pairs).await.map_err(RpcError::handler)?)
        });
        table.register("delete", |rls: Rls, raw| async move {
            let (lfn, pfn): (String, Option<String>) = params(raw)?;
            to_result(
                rls.delete(&lfn, pfn.as_deref())
                    .await
                    .map_err(RpcError::handler)?,
            )
        });
        table.register("multidelete", |rls: Rls, raw| async move {
            let (pairs,): (Vec<(String, Option<String>)>,) = params(raw)?;
            to_result(rls.multidelete(pairs).await.map_err(RpcError::handler)?)
        });
        table.register("ready", |_: Rls, _raw| async move { to_result(true) });
        table.register("clear", |rls: Rls, _raw| async move {
            to_result(rls.clear().await.map_err(RpcError::handler)?)
        });
        mule_rpc::router(table)
    }
}
