//! Method-dispatch RPC over HTTP.
//!
//! Each mule service exposes a single endpoint that accepts
//! `POST / {"method": <name>, "params": [...]}` and replies
//! `{"result": ...}` or `{"error": <message>}`. Methods are registered by
//! name in an explicit [`MethodTable`]; handlers decode their parameter
//! tuples from the JSON array and return a JSON value. Arguments and results
//! carry JSON-compatible scalars, lists, and string-keyed maps; `null` is
//! permitted.
//!
//! The [`RpcClient`] is the matching caller side. It is cheap to construct,
//! one per call site is fine.

pub use client::RpcClient;
pub use error::RpcError;
pub use server::{params, router, to_result, MethodTable, Request, Response};

mod client;
mod error;
mod server;

/// Default TCP port of the cache service.
pub const CACHE_PORT: u16 = 3881;

/// Default TCP port of the replica location service.
pub const RLS_PORT: u16 = 3880;
