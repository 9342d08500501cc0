//! Configuration file handling

use std::path::{Path, PathBuf};

use eyre::OptionExt;
use figment::{
    Figment,
    providers::{Format, Toml},
};
use nexum_card_resource::ServiceConfig;
use nexum_card_resource_pcsc::PcscConfig;
use serde::{Deserialize, Serialize};

/// Name of the configuration file inside the config directory
pub(crate) const CONFIG_FILE: &str = "card-resources.toml";

#[derive(Serialize, Deserialize, Debug, Default)]
pub(crate) struct Config {
    #[serde(flatten)]
    pub(crate) service: ServiceConfig,
    #[serde(default)]
    pub(crate) pcsc: PcscConfig,
}

/// Returns the base config directory for nexum. It also creates the directory
/// if it doesn't exist yet.
pub(crate) fn config_dir() -> eyre::Result<PathBuf> {
    let dir = std::env::home_dir()
        .ok_or_eyre("home directory not found")?
        .join(".nxm");
    if !dir.exists() {
        std::fs::create_dir(&dir)?
    }
    Ok(dir)
}

pub(crate) fn load_config(path: Option<&Path>) -> eyre::Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_dir()?.join(CONFIG_FILE),
    };
    tracing::debug!("Loading configuration from {}", path.display());
    Ok(Figment::new().merge(Toml::file(path)).extract()?)
}
