use crate::error::{Error, Result};
use crate::server::Instance;
use async_trait::async_trait;

/// Liveness check run by the scheduler's ping manager.
///
/// The scheduler bounds each call with its probe timeout; an `Err` marks the
/// instance failed and gets it stopped.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self, instance: &Instance) -> Result<()>;
}

/// Probe that sends a JSON-RPC `ping` over the instance's connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcProbe;

#[async_trait]
impl HealthProbe for RpcProbe {
    async fn ping(&self, instance: &Instance) -> Result<()> {
        let conn = instance
            .conn()
            .ok_or_else(|| Error::Probe(format!("{} has no connection", instance.id())))?;
        conn.ping()
            .await
            .map_err(|e| Error::Probe(format!("{}: {}", instance.id(), e)))
    }
}
