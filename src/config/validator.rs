use crate::config::{ServerSpec, Strategy};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Validates a server configuration
pub fn validate_server_spec(name: &str, spec: &ServerSpec) -> Result<()> {
    if spec.command.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!("Server '{}' has empty command", name)));
    }

    if spec.max_concurrent == 0 {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' must allow at least one concurrent call",
            name
        )));
    }

    if spec.strategy == Strategy::Singleton && spec.min_ready > 1 {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' is a singleton but asks for {} ready instances",
            name, spec.min_ready
        )));
    }

    Ok(())
}

/// Validates a map of server configurations
pub fn validate_server_specs(specs: &HashMap<String, ServerSpec>) -> Result<()> {
    if specs.is_empty() {
        return Err(Error::ConfigInvalid("No servers configured".to_string()));
    }

    let mut names: Vec<&String> = specs.keys().collect();
    names.sort();
    for name in names {
        validate_server_spec(name, &specs[name])?;
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(specs: &HashMap<String, ServerSpec>) -> Result<()> {
    validate_server_specs(specs)
}
