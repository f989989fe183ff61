//! Reflector worker + progress server.
//!
//! One process runs both: an axum app exposing health, a manifest enqueue
//! endpoint, and a per-transcript WebSocket event stream; pipelines run on
//! the same runtime.

mod routes;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use reflector_config::load_settings;
use reflector_llm::{HttpLlm, LlmConfig};
use reflector_persistence::{ConsentStore, TaskCheckpoints, TranscriptStore};
use reflector_pipeline::{HttpAsr, NullPlatform, PipelineDeps, ProgressBus};
use reflector_storage::S3Storage;

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let env = std::env::var("REFLECTOR_ENV").ok();
    let settings = load_settings(env.as_deref())?;

    let store = TranscriptStore::connect(&settings.database.url).await?;
    let checkpoints = TaskCheckpoints::new(store.pool().clone());
    let consent = ConsentStore::new(store.pool().clone());
    let bus = ProgressBus::new(store.clone());
    let storage = Arc::new(S3Storage::connect(&settings.storage).await);
    let asr = Arc::new(HttpAsr::new(&settings.asr)?);
    let llm = Arc::new(HttpLlm::new(LlmConfig::from(&settings.llm))?);

    let deps = Arc::new(PipelineDeps {
        settings: settings.clone(),
        store,
        checkpoints,
        consent,
        storage,
        bus,
        asr,
        llm,
        platform: Arc::new(NullPlatform),
    });

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "reflector listening");

    let app = routes::router(AppState::new(deps));
    axum::serve(listener, app).await?;
    Ok(())
}
