//! Environment variable integration for agent-mcp configuration

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable names used by agent-mcp
pub struct EnvVars;

impl EnvVars {
    pub const CONFIG_PATH: &'static str = "AGENT_MCP_CONFIG";
}

/// Config file used when neither a flag nor `AGENT_MCP_CONFIG` names one
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([^}]+)\}").unwrap_or_else(|e| panic!("invalid placeholder pattern: {}", e))
});

/// Load `.env` then `.env.local` (later files override earlier ones)
pub fn load_env_files() {
    for env_file in [".env", ".env.local"] {
        match dotenvy::from_filename(env_file) {
            Ok(_) => debug!("Loaded environment variables from {}", env_file),
            Err(e) if e.not_found() => debug!("No {} file found, skipping", env_file),
            Err(e) => warn!("Failed to load {}: {}", env_file, e),
        }
    }
}

/// Resolve the config path: explicit path, then `AGENT_MCP_CONFIG`, then `./config.yaml`
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match env::var(EnvVars::CONFIG_PATH) {
        Ok(path) if !path.is_empty() => {
            debug!("Environment override: {}={}", EnvVars::CONFIG_PATH, path);
            PathBuf::from(path)
        }
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

/// Replace every `${VAR}` with the variable's value; unset variables become empty
pub fn expand_env_vars(input: &str) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures| {
            env::var(&caps[1]).unwrap_or_else(|_| {
                debug!("Environment variable {} is not set, substituting empty string", &caps[1]);
                String::new()
            })
        })
        .into_owned()
}

/// Walk a YAML tree and expand placeholders in every string value
pub fn resolve_env_placeholders(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${") {
                *s = expand_env_vars(s);
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items.iter_mut() {
                resolve_env_placeholders(item);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                resolve_env_placeholders(item);
            }
        }
        serde_yaml::Value::Tagged(tagged) => resolve_env_placeholders(&mut tagged.value),
        _ => {}
    }
}
