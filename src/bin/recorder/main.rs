mod api;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use rpa_trace::config::default_output_dir;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HTTP backend for the browser extension: records page actions into traces.
#[derive(Parser)]
#[command(name = "recorder", version)]
struct Args {
    #[arg(long, env = "RECORDER_BIND", default_value = "0.0.0.0:8000")]
    bind: String,
    #[arg(long, env = "RPA_TRACE_OUTPUT_DIR", default_value_os_t = default_output_dir())]
    output_dir: PathBuf,
    /// Keep screenshots at the size the extension captured them.
    #[arg(long)]
    no_resize: bool,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    /// Also write a JSON mirror of every trace.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let resize_to = (!args.no_resize).then_some((args.width, args.height));
    let state = Arc::new(api::AppState::new(args.output_dir.clone(), resize_to, args.json));
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("could not bind {}", args.bind))?;
    info!(
        address = %args.bind,
        output_dir = %args.output_dir.display(),
        "recorder listening"
    );
    axum::serve(listener, app).await.context("server stopped")?;
    Ok(())
}
