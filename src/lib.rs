/*!
 # MCP Fleet

 A Rust library for running a fleet of Model Context Protocol (MCP) server
 processes and scheduling client calls onto them.

 ## Overview

 MCP Fleet provides functionality to:
 - Describe servers in a JSON or YAML catalog and fingerprint them into spec keys
 - Start worker instances on demand, with concurrent cold starts collapsed into one
 - Place calls with one of four strategies: stateless, stateful (sticky), singleton, persistent
 - Reclaim idle instances, expire sticky bindings and evict unhealthy instances
 - Apply catalog reloads to running pools without stranding processes

 ## Basic Usage

 ```no_run
 use mcp_fleet::config::Config;
 use mcp_fleet::router::Router;
 use mcp_fleet::scheduler::{Scheduler, SchedulerOptions};
 use mcp_fleet::server::{ProcessLifecycle, RpcProbe};
 use mcp_fleet::Result;
 use serde_json::{json, Value};
 use std::sync::Arc;

 #[tokio::main]
 async fn main() -> Result<()> {
     let config = Config::from_file("catalog.yaml")?;
     let registry = config.registry();

     let lifecycle = Arc::new(ProcessLifecycle::new(
         config.runtime.start_timeout(),
         config.runtime.stop_timeout(),
     ));
     let options = SchedulerOptions::from_runtime(&config.runtime).with_probe(Arc::new(RpcProbe));
     let scheduler = Scheduler::new(lifecycle, registry.clone(), options);
     scheduler.start_idle_manager(config.runtime.idle_check_interval());
     scheduler.start_ping_manager(config.runtime.ping_interval());

     // Route a tool call to the "fetch" server
     let (key, _) = registry
         .iter()
         .find(|(_, spec)| spec.name == "fetch")
         .expect("fetch is configured");
     let router = Router::new(scheduler.clone());
     let result: Value = router
         .call_tool(key, "", "fetch", &json!({"url": "https://modelcontextprotocol.io"}))
         .await?;
     println!("Result: {:?}", result);

     scheduler.stop_all().await;
     Ok(())
 }
 ```

 ## Features

 - **Singleflight starts**: N callers needing a cold start trigger one start
 - **Placement strategies**: least-loaded with round-robin tie-break, sticky sessions, singleton waits
 - **Reclamation**: idle reap with a ready floor, session TTLs, health-probe eviction
 - **Live reconfiguration**: catalog diffs applied to running pools
 - **Async Support**: Full async/await support on Tokio
*/

pub mod config;
pub mod error;
pub mod metrics;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use config::{Config, ServerSpec, SpecKey, Strategy};
pub use error::{Error, Result};
pub use router::Router;
pub use scheduler::Scheduler;
pub use server::{Instance, InstanceState};
