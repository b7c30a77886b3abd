#![allow(clippy::collapsible_if)]

mod cache;
mod config;
mod dispatch;
mod failure_log;
mod fallbacks;
mod fetch;
mod http;
mod pipeline;
mod processor;
mod state;
mod token;
mod transform;

use crate::config::Config;
use crate::failure_log::{FAILURE_CHANNEL_CAPACITY, FailureLog};
use crate::state::AppState;
use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;

#[derive(Parser)]
#[command(name = "image-gateway")]
#[command(about = "On-demand image transformation gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway (default)
    Serve,
    /// Print the public image name for a source URL
    Encode {
        /// Source URL or absolute path
        url: String,
    },
    /// Decrypt an identifier back into its source URL
    Decode {
        /// Identifier, with or without its file extension
        identifier: String,
    },
    /// Print a fresh base64 IV for the configured cipher
    GenerateIv,
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    http::router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Encode { url } => {
            let codec = Config::from_env()?.token_codec()?;
            println!("{}", pipeline::image_name(&codec, &url)?);
            Ok(())
        }
        Commands::Decode { identifier } => {
            let codec = Config::from_env()?.token_codec()?;
            let token = identifier
                .rsplit('/')
                .next()
                .unwrap_or(identifier.as_str())
                .split('.')
                .next()
                .unwrap_or_default();
            println!("{}", codec.decode(token)?);
            Ok(())
        }
        Commands::GenerateIv => {
            let cipher = config::cipher_from_env()?;
            println!("{}", cipher.generate_iv()?);
            Ok(())
        }
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    info!(
        storage_dir = %config.storage_dir.display(),
        cipher = %config.cipher,
        use_cache = config.use_cache,
        fallback_image = ?config.fallback_image,
        processor = %config.processor_bin.display(),
        additional_transformations = ?config.additional_transformations,
        "config loaded"
    );
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("create storage dir {}", config.storage_dir.display()))?;

    let failure_log = match config.failure_log_path.clone() {
        Some(path) => FailureLog::new(path, config.failure_log_max_bytes),
        None => None,
    };
    let failure_tx = failure_log.map(|log| {
        let (sender, receiver) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);
        tokio::spawn(failure_log::run_failure_log(log, receiver));
        sender
    });

    let state = Arc::new(AppState::from_config(config, failure_tx)?);
    let app = build_app(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
