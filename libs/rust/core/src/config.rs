//! Layered configuration loading.
//!
//! Precedence, lowest first: service defaults, `GATEWAY_CONFIG_FILE` (yaml/toml/json by
//! extension), `GATEWAY_CONFIG_HTTP` (yaml fetched once at load), `GATEWAY_*` environment
//! variables with `__` separating nested keys.

use anyhow::Result;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};
use serde::de::DeserializeOwned;

pub type ConfigDefaults = ConfigBuilder<DefaultState>;

pub async fn load_config<T, F>(service: &str, defaults: F) -> Result<T>
where
    T: DeserializeOwned,
    F: FnOnce(ConfigDefaults) -> Result<ConfigDefaults, ConfigError>,
{
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("log_level", "info")?;
    builder = defaults(builder)?;

    if let Ok(file) = std::env::var("GATEWAY_CONFIG_FILE") {
        tracing::debug!(%file, "adding config file source");
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    if let Ok(http_url) = std::env::var("GATEWAY_CONFIG_HTTP") {
        match fetch_remote(&http_url).await {
            Ok(text) => { builder = builder.add_source(config::File::from_str(&text, config::FileFormat::Yaml)); }
            Err(e) => tracing::warn!(error=?e, url=%http_url, "remote config unavailable, continuing without it"),
        }
    }
    builder = builder.add_source(config::Environment::with_prefix("GATEWAY").separator("__"));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

async fn fetch_remote(url: &str) -> Result<String> {
    let resp = reqwest::get(url).await?.error_for_status()?;
    Ok(resp.text().await?)
}
