use crate::config::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Load config from a TOML file, apply env-var secret overrides, validate.
///
/// With no path (or a missing file) the defaults are used, which still
/// requires `MXF_DOMAIN_KEY` to pass validation.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) if path.exists() => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config TOML from {}", path.display()))?
        }
        Some(path) => {
            anyhow::bail!("config file not found: {}", path.display());
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    config
        .validate()
        .context("configuration validation failed")?;
    Ok(config)
}

/// Secrets prefer the environment over the config file so deployments can
/// keep credentials out of on-disk config.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(key) = std::env::var("MXF_DOMAIN_KEY") {
        if !key.is_empty() {
            config.auth.domain_key = key;
        }
    }
    if let Ok(key) = std::env::var("MXF_PROVIDER_API_KEY") {
        if !key.is_empty() {
            config.provider.api_key = key;
        }
    }
}
