//! Connections to running MCP server instances.
//!
//! The scheduler treats a connection as an opaque handle: it stores one on
//! each [`Instance`](crate::server::Instance) and hands it to the health
//! probe and the router, but never speaks the protocol itself. [`Conn`] is
//! the seam; [`StdioConn`] is the line-delimited JSON-RPC implementation
//! used for stdio servers.
mod json_rpc;
mod stdio;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

pub use json_rpc::{
    JSON_RPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
pub use stdio::StdioConn;

/// A request/response channel to one server instance.
#[async_trait]
pub trait Conn: Send + Sync + Debug {
    /// Sends a request and returns its `result` payload.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Sends a notification; no response is expected.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Liveness check used by the health probe.
    async fn ping(&self) -> Result<()> {
        self.request("ping", None).await.map(|_| ())
    }

    /// Releases the connection. Pending requests fail.
    async fn close(&self) -> Result<()>;
}
