// Configuration management

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{AppConfig, ModelInfo, MODEL_FAST, MODEL_PRO};

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("zhixia");

    fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

pub fn get_models_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("models.json"))
}

pub fn load_config() -> Result<AppConfig> {
    load_config_from(&get_config_path()?)
}

/// Load the config at `path`, writing the defaults there on first use.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let default_config = AppConfig::default();
        save_config_to(path, &default_config)?;
        return Ok(default_config);
    }

    let contents = fs::read_to_string(path).context("Failed to read config file")?;

    let config: AppConfig = toml::from_str(&contents).context("Failed to parse config file")?;

    Ok(config)
}

pub fn save_config(config: &AppConfig) -> Result<()> {
    save_config_to(&get_config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(path, contents).context("Failed to write config file")?;

    Ok(())
}

pub fn default_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            name: MODEL_FAST.to_string(),
            label: "Gemini Flash".to_string(),
            max_output_tokens: 64_000,
        },
        ModelInfo {
            name: MODEL_PRO.to_string(),
            label: "Gemini Pro".to_string(),
            max_output_tokens: 64_000,
        },
    ]
}

pub fn load_models() -> Result<Vec<ModelInfo>> {
    load_models_from(&get_models_path()?)
}

pub fn load_models_from(path: &Path) -> Result<Vec<ModelInfo>> {
    if !path.exists() {
        let models = default_models();
        save_models_to(path, &models)?;
        return Ok(models);
    }

    let contents = fs::read_to_string(path).context("Failed to read models file")?;

    let models: Vec<ModelInfo> =
        serde_json::from_str(&contents).context("Failed to parse models file")?;

    Ok(models)
}

pub fn save_models_to(path: &Path, models: &[ModelInfo]) -> Result<()> {
    let contents = serde_json::to_string_pretty(models).context("Failed to serialize models")?;

    fs::write(path, contents).context("Failed to write models file")?;

    Ok(())
}
