use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod inference;

use api::AppState;
use inference::gpt2::{Gpt2Service, MODEL_ID};
use inference::InferenceService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("🚀 Starting GPT-2 next-word server...");

    // -----------------------------
    // Shared state / Dependencies
    // -----------------------------
    // Loaded exactly once; a resolution failure aborts startup.
    let gpt2 = Arc::new(Gpt2Service::load(MODEL_ID)?);
    let infer = Arc::new(InferenceService::new(gpt2));

    let state = AppState { infer };

    // -----------------------------
    // Router
    // -----------------------------
    let app = Router::new()
        .merge(api::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let addr = "0.0.0.0:3000";

    println!("🌐 HTTP listening on http://{addr}");
    println!("✍️  Demo page at http://{addr}/");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
