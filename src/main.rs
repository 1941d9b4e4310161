use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;

use nutrition_agent::config::AppConfig;
use nutrition_agent::handlers::NutritionAgent;
use nutrition_agent::server::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::init();

    // Load environment variables
    dotenv().ok();

    log::info!("🚀 Starting VLM Nutrition Agent...");

    let config = AppConfig::from_env()?;
    log::info!(
        "✅ Vision backends: ollama ({} @ {}), openai ({})",
        config.ollama_model,
        config.ollama_host,
        if config.openai_api_key.is_some() {
            config.openai_model.as_str()
        } else {
            "disabled, OPENAI_API_KEY not set"
        }
    );
    if config.fdc.api_key.is_none() {
        log::warn!("⚠️ USDA_FDC_API_KEY not set, nutrition lookups will fail");
    }
    log::info!(
        "📚 Guidance docs: {} (embeddings: {} @ {})",
        config.rag_docs_dir.display(),
        config.embed_model,
        config.embed_host
    );

    let agent = NutritionAgent::from_config(&config);
    let addr = config.server_addr.clone();
    let app = create_router(Arc::new(AppState { agent, config }));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("🌐 HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("❌ Failed to listen for Ctrl+C: {}", e);
            }
            log::info!("🛑 Shutting down...");
        })
        .await?;

    Ok(())
}
