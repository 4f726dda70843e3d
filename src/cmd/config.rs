//! `cloudx config`: the effective configuration, secrets masked.

use anyhow::{Context, Result};

use cloudx::config::CloudxConfig;

pub fn cmd_config(config: &CloudxConfig) -> Result<()> {
    let rendered =
        toml::to_string(&config.redacted()).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
