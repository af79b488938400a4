//! Environment-derived service configuration.

use anyhow::Context;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub openrouter_api_key: String,
    /// Model identifier passed to OpenRouter.
    pub model: String,
    /// Directory holding the session document (`results.json`).
    pub data_dir: PathBuf,
    /// Directory prescriptions are rendered into and served from.
    pub output_dir: PathBuf,
    /// Page background for generated prescriptions. Skipped if missing.
    pub background_image: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let openrouter_api_key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY environment variable is required")?;

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse::<u16>()
            .unwrap_or(8000);

        let model =
            std::env::var("LLM_MODEL").unwrap_or_else(|_| "openai/gpt-4o-mini".to_string());

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data-files"));

        let output_dir = std::env::var("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("output-files"));

        let background_image = std::env::var("PRESCRIPTION_BACKGROUND")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("assets/prescription-bg.png"));

        Ok(Self {
            port,
            openrouter_api_key,
            model,
            data_dir,
            output_dir,
            background_image,
        })
    }
}
