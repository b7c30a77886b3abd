use crate::config::Config;
use crate::failure_log::FailureLogEntry;
use crate::fetch::OriginFetcher;
use crate::pipeline::{HandlerSettings, ImageHandler};
use crate::processor::ImageMagick;
use crate::transform::TransformationRegistry;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub handler: Arc<ImageHandler>,
    pub failure_tx: Option<mpsc::Sender<FailureLogEntry>>,
}

impl AppState {
    pub fn new(
        config: Config,
        handler: ImageHandler,
        failure_tx: Option<mpsc::Sender<FailureLogEntry>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            failure_tx,
        }
    }

    /// Wires the production collaborators: reqwest origin fetcher and the
    /// ImageMagick command runner.
    pub fn from_config(
        config: Config,
        failure_tx: Option<mpsc::Sender<FailureLogEntry>>,
    ) -> Result<Self> {
        let codec = config.token_codec().context("build token codec")?;
        let registry = TransformationRegistry::with_builtin().context("compile presets")?;
        let fetcher = OriginFetcher::new(config.fetch_timeout, config.max_source_bytes)?;
        info!(
            cipher = %codec.cipher(),
            transformations = registry.len(),
            "token codec and transformations ready"
        );
        let processor = ImageMagick::new(config.processor_bin.clone(), config.processor_timeout);
        let handler = ImageHandler::new(
            HandlerSettings::from_config(&config),
            codec,
            registry,
            Arc::new(fetcher),
            Arc::new(processor),
        );
        Ok(Self::new(config, handler, failure_tx))
    }

    pub fn record_failure(&self, entry: FailureLogEntry) {
        let Some(sender) = self.failure_tx.as_ref() else {
            return;
        };
        if let Err(err) = sender.try_send(entry) {
            warn!(error = %err, "failure log queue full, dropping entry");
        }
    }
}
