use crate::cache::{self, ConversionSingleflight, StorageError};
use crate::config::Config;
use crate::dispatch::{self, Dispatch};
use crate::fallbacks;
use crate::fetch::{FetchError, SourceFetcher, SourceLocation};
use crate::processor::{ConversionError, ImageProcessor};
use crate::token::{CryptoError, TokenCodec};
use crate::transform::{TransformError, TransformationRegistry};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MIN_REQUEST_SEGMENTS: usize = 4;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("additional transformations without cache mode are unsupported")]
    UnsupportedMode,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::UnsupportedMode => "unsupported_mode",
            PipelineError::Crypto(_) => "crypto",
            PipelineError::Transform(TransformError::NotFound(_)) => "transformation_not_found",
            PipelineError::Transform(TransformError::PatternMismatch { .. }) => "pattern_mismatch",
            PipelineError::Transform(TransformError::InvalidPattern { .. }) => "invalid_pattern",
            PipelineError::Fetch(_) => "fetch",
            PipelineError::Conversion(_) => "conversion",
            PipelineError::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub storage_dir: PathBuf,
    pub use_cache: bool,
    pub fallback_image: Option<PathBuf>,
    /// How long a request waits for a concurrent conversion of the same
    /// artifact before converting on its own.
    pub conversion_wait: Duration,
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            storage_dir: config.storage_dir.clone(),
            use_cache: config.use_cache,
            fallback_image: config.fallback_image.clone(),
            conversion_wait: config.processor_timeout,
        }
    }
}

/// Fields of the inbound path that the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Last path segment including its extension; the cache file name.
    pub identifier: String,
    /// The identifier without its extension; the encrypted source URL.
    pub token: String,
    pub transformation: String,
}

pub fn parse_request_path(request_url: &str) -> Result<ParsedRequest, PipelineError> {
    let path = request_url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_start_matches('/');
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < MIN_REQUEST_SEGMENTS {
        return Err(PipelineError::InvalidRequest(format!(
            "expected at least {MIN_REQUEST_SEGMENTS} path segments, got {}",
            segments.len()
        )));
    }
    let identifier = segments[segments.len() - 1];
    let transformation = segments[segments.len() - MIN_REQUEST_SEGMENTS];
    if !is_safe_segment(transformation) {
        return Err(PipelineError::InvalidRequest(format!(
            "invalid transformation segment {transformation:?}"
        )));
    }
    if !is_identifier_file_name(identifier) {
        return Err(PipelineError::InvalidRequest(format!(
            "invalid identifier {identifier:?}"
        )));
    }
    cache::shard_prefix(identifier)
        .map_err(|err| PipelineError::InvalidRequest(err.to_string()))?;
    let token = match identifier.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => identifier,
    };
    Ok(ParsedRequest {
        identifier: identifier.to_string(),
        token: token.to_string(),
        transformation: transformation.to_string(),
    })
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment.len() <= 128
        && segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
}

fn is_identifier_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
}

/// Public image name for `source_url`: `{c1}/{c2}/{identifier}.{ext}`,
/// suitable as the tail of a request path after the transformation
/// segment.
pub fn image_name(codec: &TokenCodec, source_url: &str) -> Result<String, PipelineError> {
    let source = SourceLocation::parse(source_url).ok_or_else(|| {
        PipelineError::InvalidRequest(format!("source url {source_url:?} has no path"))
    })?;
    let extension = source.extension().ok_or_else(|| {
        PipelineError::InvalidRequest(format!("source url {source_url:?} has no extension"))
    })?;
    let name = format!("{}.{extension}", codec.encode(source_url)?);
    let (first, second) = cache::shard_prefix(&name)?;
    Ok(format!("{first}/{second}/{name}"))
}

/// Scratch file owned by one request: the downloaded source, or a
/// conversion output not yet moved into the cache. Removed when dropped,
/// whatever the outcome.
#[derive(Debug)]
pub struct TransientFile {
    path: PathBuf,
}

impl TransientFile {
    fn new(root: &Path, identifier: &str) -> Self {
        let nonce: u64 = rand::random();
        Self {
            path: root.join(format!(".{identifier}.{nonce:016x}.tmp")),
        }
    }

    fn staging(destination: &Path) -> Self {
        Self {
            path: cache::staging_path(destination, rand::random()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "transient file deleted"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(error = ?err, path = %self.path.display(), "delete transient file failed")
            }
        }
    }
}

/// Per-request state. Dropping it removes the transient file.
#[derive(Debug)]
pub struct RequestContext {
    pub request_url: String,
    pub source: SourceLocation,
    pub identifier: String,
    pub transformation: String,
    pub additional: Vec<String>,
    pub use_cache: bool,
    pub transient: TransientFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub request_url: String,
    pub artifact: PathBuf,
    pub content_type: &'static str,
}

/// Result of one request after the single recovery point: either a served
/// artifact or a fallback together with the error that caused it.
#[derive(Debug)]
pub struct Handled {
    pub dispatch: Dispatch,
    pub error: Option<PipelineError>,
}

pub struct ImageHandler {
    settings: HandlerSettings,
    codec: TokenCodec,
    registry: TransformationRegistry,
    fetcher: Arc<dyn SourceFetcher>,
    processor: Arc<dyn ImageProcessor>,
    singleflight: ConversionSingleflight,
}

impl ImageHandler {
    pub fn new(
        settings: HandlerSettings,
        codec: TokenCodec,
        registry: TransformationRegistry,
        fetcher: Arc<dyn SourceFetcher>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Self {
        Self {
            settings,
            codec,
            registry,
            fetcher,
            processor,
            singleflight: ConversionSingleflight::new(),
        }
    }

    /// Runs one request end to end. Every error is recovered here and turned
    /// into a fallback image; nothing partial is ever served.
    pub async fn handle(&self, request_url: &str, additional: &[String]) -> Handled {
        let served = match self.run(request_url, additional).await {
            Ok(materialized) => dispatch::serve_artifact(materialized, self.settings.use_cache)
                .await
                .map_err(PipelineError::from),
            Err(err) => Err(err),
        };
        match served {
            Ok(dispatch) => Handled {
                dispatch,
                error: None,
            },
            Err(error) => {
                warn!(
                    request = %request_url,
                    kind = error.kind(),
                    error = %error,
                    "process failed"
                );
                let fallback = fallbacks::load_fallback(self.settings.fallback_image.as_deref()).await;
                Handled {
                    dispatch: Dispatch::Fallback(fallback),
                    error: Some(error),
                }
            }
        }
    }

    pub async fn run(
        &self,
        request_url: &str,
        additional: &[String],
    ) -> Result<Materialized, PipelineError> {
        let ctx = self.extract(request_url, additional)?;
        if !ctx.use_cache && !ctx.additional.is_empty() {
            warn!("additional transformations requested without cache mode");
            return Err(PipelineError::UnsupportedMode);
        }

        let written = self.fetcher.fetch(&ctx.source, ctx.transient.path()).await?;
        info!(source = %ctx.source, size = written, "download file success");

        for name in &ctx.additional {
            match self.materialize(name, &ctx).await {
                Ok(_) => {}
                Err(PipelineError::Storage(err @ StorageError::Copy { .. })) => {
                    warn!(transformation = %name, error = %err, "copy for additional transformation failed");
                }
                Err(err) => return Err(err),
            }
        }
        let artifact = self.materialize(&ctx.transformation, &ctx).await?;
        Ok(Materialized {
            request_url: ctx.request_url.clone(),
            artifact,
            content_type: dispatch::content_type_from_path(&ctx.identifier)
                .unwrap_or("application/octet-stream"),
        })
    }

    fn extract(&self, request_url: &str, additional: &[String]) -> Result<RequestContext, PipelineError> {
        info!(request = %request_url, storage = %self.settings.storage_dir.display(), "new request");
        let parsed = parse_request_path(request_url)?;
        debug!(identifier = %parsed.identifier, "encrypted image url");
        let decoded = self.codec.decode(&parsed.token)?;
        let source = SourceLocation::parse(&decoded).ok_or_else(|| {
            warn!(decoded = %decoded, "invalid input file");
            PipelineError::InvalidRequest("decoded source is not a url with a path".to_string())
        })?;
        let transient = TransientFile::new(&self.settings.storage_dir, &parsed.identifier);
        info!(
            source = %source,
            transformation = %parsed.transformation,
            transient = %transient.path().display(),
            "request resolved"
        );
        Ok(RequestContext {
            request_url: request_url.to_string(),
            source,
            identifier: parsed.identifier,
            transformation: parsed.transformation,
            additional: additional.to_vec(),
            use_cache: self.settings.use_cache,
            transient,
        })
    }

    pub async fn materialize(
        &self,
        transformation: &str,
        ctx: &RequestContext,
    ) -> Result<PathBuf, PipelineError> {
        info!(transformation = %transformation, "process transformation");
        if !is_safe_segment(transformation) {
            return Err(PipelineError::InvalidRequest(format!(
                "invalid transformation segment {transformation:?}"
            )));
        }
        let destination =
            cache::cache_path(&self.settings.storage_dir, transformation, &ctx.identifier)?;
        let spec = self.registry.resolve(transformation).inspect_err(|_| {
            warn!(transformation = %transformation, "transformation not found");
        })?;
        debug!(
            transformation = %transformation,
            kind = ?spec.kind(),
            pattern = spec.pattern(),
            "transformation resolved"
        );
        let params = spec.params(transformation)?;
        if let Some(parent) = destination.parent() {
            cache::ensure_dir(parent).await?;
        }

        let _permit = if ctx.use_cache {
            let permit = self
                .singleflight
                .acquire(&destination.to_string_lossy());
            if !permit.is_leader() {
                permit.wait_for_leader(self.settings.conversion_wait).await;
            }
            if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
                info!(path = %destination.display(), "cached artifact reused");
                return Ok(destination);
            }
            Some(permit)
        } else {
            None
        };

        // The cache path only ever receives a finished artifact.
        let staging = TransientFile::staging(&destination);
        if params.is_empty() {
            tokio::fs::copy(ctx.transient.path(), staging.path())
                .await
                .map_err(|source| StorageError::Copy {
                    from: ctx.transient.path().to_path_buf(),
                    to: staging.path().to_path_buf(),
                    source,
                })?;
        } else {
            self.processor
                .run(ctx.transient.path(), &params, staging.path())
                .await?;
        }
        tokio::fs::rename(staging.path(), &destination)
            .await
            .map_err(|source| StorageError::Rename {
                from: staging.path().to_path_buf(),
                to: destination.clone(),
                source,
            })?;
        info!(
            path = %destination.display(),
            passthrough = params.is_empty(),
            "transformation success"
        );
        Ok(destination)
    }
}
