use std::{net::SocketAddr, sync::Arc, time::Duration};

use extraction::{LlmClient, MissingLlmClient, OpenAiClient, OpenAiConfig, Pipeline};
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::with_cache_capacity(&database_url, settings.layout_cache_capacity)
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;

    let state = AppState {
        pipeline: Pipeline::new(storage, llm_client(&settings)?),
    };
    let app = api::build_router(Arc::new(state), &settings);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, static_dir = %settings.static_dir, model = %settings.openai_model, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn llm_client(settings: &Settings) -> anyhow::Result<Arc<dyn LlmClient>> {
    let Some(api_key) = settings.openai_api_key.as_deref() else {
        warn!("OPENAI_API_KEY is not set; documents that need the LLM fallback will fail");
        return Ok(Arc::new(MissingLlmClient));
    };

    let config = OpenAiConfig::new(api_key)
        .with_model(settings.openai_model.clone())
        .with_base_url(settings.openai_base_url.clone())
        .with_timeout(Duration::from_secs(settings.llm_timeout_seconds));
    Ok(Arc::new(OpenAiClient::new(config)?))
}
