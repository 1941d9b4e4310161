//! Environment-driven configuration (`.env` is loaded by the binaries).

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const OFFICIAL_OPENAI_BASE: &str = "https://api.openai.com/v1";

/// A credential that a stage needs but the process was started without.
/// Never retried; surfaced to the caller as a configuration error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0} is not set in this process")]
pub struct MissingCredential(pub &'static str);

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_addr: String,

    pub ollama_host: String,
    pub ollama_model: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,

    pub fdc: FdcConfig,

    pub rag_docs_dir: PathBuf,
    pub embed_host: String,
    pub embed_model: String,
    pub rag_top_k: usize,
}

#[derive(Debug, Clone)]
pub struct FdcConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for FdcConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.nal.usda.gov/fdc".to_string(),
            timeout: Duration::from_secs(20),
            retries: 3,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let ollama_host = var_or("OLLAMA_HOST", "http://localhost:11434");
        let defaults = FdcConfig::default();
        let timeout_s: f64 = parse_var("FDC_TIMEOUT_S", defaults.timeout.as_secs_f64())?;
        let timeout = fdc_timeout(timeout_s)?;

        Ok(Self {
            server_addr: var_or("SERVER_ADDR", "0.0.0.0:8000"),
            ollama_model: var_or("OLLAMA_MODEL", "qwen3-vl:8b"),
            openai_api_key: optional_var("OPENAI_API_KEY"),
            openai_model: var_or("OPENAI_MODEL", "gpt-4o-mini"),
            fdc: FdcConfig {
                api_key: optional_var("USDA_FDC_API_KEY"),
                base_url: var_or("FDC_BASE", &defaults.base_url),
                timeout,
                retries: parse_var("FDC_RETRIES", defaults.retries)?,
            },
            rag_docs_dir: PathBuf::from(var_or("RAG_DOCS_DIR", "rag_docs")),
            embed_host: var_or("EMBED_HOST", &ollama_host),
            embed_model: var_or("EMBED_MODEL", "all-minilm"),
            rag_top_k: parse_var("RAG_TOP_K", 3)?,
            ollama_host,
        })
    }
}

fn fdc_timeout(seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        anyhow::bail!("FDC_TIMEOUT_S must be a positive number of seconds, got {}", seconds);
    }
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("FDC_TIMEOUT_S is out of range: {}", seconds))
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    optional_var(key).unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
