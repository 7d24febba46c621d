/// Request routing over scheduled instances.
///
/// The `Router` wraps one request/response exchange: it acquires an instance
/// from the [`Scheduler`], sends the request over the instance's connection,
/// records the call, and always hands the capacity back. The release happens
/// in the [`Lease`] guard, so it also runs when the exchange fails or the
/// caller drops the future midway.
///
/// # Examples
///
/// ```no_run
/// use mcp_fleet::config::SpecKey;
/// use mcp_fleet::router::Router;
/// use mcp_fleet::scheduler::Scheduler;
/// use serde_json::{Value, json};
///
/// # async fn run(scheduler: Scheduler, key: SpecKey) -> mcp_fleet::error::Result<()> {
/// let router = Router::new(scheduler);
/// let result: Value = router
///     .call_tool(&key, "session-42", "fetch", &json!({"url": "https://example.com"}))
///     .await?;
/// println!("{}", result);
/// # Ok(())
/// # }
/// ```
use crate::config::SpecKey;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::server::Instance;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::Instant;

/// Reserved capacity on one instance, released on drop.
#[derive(Debug)]
pub struct Lease {
    scheduler: Scheduler,
    instance: Arc<Instance>,
}

impl Lease {
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.scheduler.release(&self.instance);
    }
}

/// Routes requests onto scheduled instances.
#[derive(Debug, Clone)]
pub struct Router {
    scheduler: Scheduler,
}

impl Router {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Acquires capacity for one exchange.
    pub async fn lease(&self, spec_key: &SpecKey, routing_key: &str) -> Result<Lease> {
        let instance = self.scheduler.acquire(spec_key, routing_key).await?;
        Ok(Lease {
            scheduler: self.scheduler.clone(),
            instance,
        })
    }

    /// Sends one request to an instance of `spec_key` and returns its result.
    #[tracing::instrument(skip(self, params), fields(spec_key = %spec_key))]
    pub async fn route(
        &self,
        spec_key: &SpecKey,
        routing_key: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let lease = self.lease(spec_key, routing_key).await?;
        let instance = lease.instance();

        let started = Instant::now();
        let result = match instance.conn() {
            Some(conn) => conn.request(method, params).await,
            None => Err(Error::Transport(format!(
                "instance {} has no connection",
                instance.id()
            ))),
        };
        let elapsed = started.elapsed();

        instance.record_call(elapsed, result.is_err());
        self.scheduler
            .metrics()
            .observe_route(spec_key, elapsed, result.is_ok());
        if let Err(e) = &result {
            tracing::debug!(instance_id = %instance.id(), error = %e, "Routed request failed");
        }
        result
    }

    /// Calls an MCP tool with typed arguments and result.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * No instance could be acquired
    /// * The tool call fails
    /// * The arguments cannot be serialized
    /// * The result cannot be deserialized to type R
    pub async fn call_tool<T, R>(
        &self,
        spec_key: &SpecKey,
        routing_key: &str,
        name: &str,
        args: &T,
    ) -> Result<R>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let args_value = serde_json::to_value(args).map_err(|e| {
            Error::Serialization(format!("Failed to serialize tool arguments: {}", e))
        })?;

        let params = json!({ "name": name, "arguments": args_value });
        let result_value = self
            .route(spec_key, routing_key, "tools/call", Some(params))
            .await?;

        serde_json::from_value(result_value)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize tool result: {}", e)))
    }
}
