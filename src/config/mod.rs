//! Configuration module for MCP Fleet.
//!
//! This module handles parsing, validation, and identity of server specs.
//! It supports loading a catalog from JSON or YAML files, turning it into a
//! registry keyed by [`SpecKey`], and computing the [`CatalogDiff`] between
//! two registries when the catalog is reloaded.
//!
//! # Examples
//!
//! Loading a catalog and building the registry:
//!
//! ```no_run
//! use mcp_fleet::config::{Config, validate_config};
//!
//! let config = Config::from_file("catalog.yaml").unwrap();
//! validate_config(&config.mcp_servers).unwrap();
//! let registry = config.registry();
//! println!("{} distinct runtime identities", registry.len());
//! ```
//!
//! Specs with the same runtime content share a key:
//!
//! ```
//! use mcp_fleet::config::{ServerSpec, SpecKey};
//!
//! let a = ServerSpec::new("fetch-a", "uvx");
//! let b = ServerSpec::new("fetch-b", "uvx");
//! assert_eq!(SpecKey::of(&a), SpecKey::of(&b));
//! ```
mod diff;
mod parser;
mod spec;
mod spec_key;
pub mod validator;

pub use diff::CatalogDiff;
pub use parser::{Config, RuntimeConfig};
pub use spec::{
    DEFAULT_MAX_CONCURRENT, DEFAULT_PROTOCOL_VERSION, DEFAULT_SESSION_TTL_SECONDS, ServerSpec,
    Strategy,
};
pub use spec_key::SpecKey;
pub use validator::validate_config;
