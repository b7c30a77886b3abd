use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {status:?}: {diagnostics}")]
    Failed {
        program: String,
        status: Option<i32>,
        diagnostics: String,
    },
    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

/// Raster processor collaborator. Implementations must leave a file at
/// `destination` when they return `Ok`.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    async fn run(
        &self,
        source: &Path,
        params: &[String],
        destination: &Path,
    ) -> Result<(), ConversionError>;
}

#[derive(Debug, Clone)]
pub struct ImageMagick {
    program: PathBuf,
    timeout: Duration,
}

impl ImageMagick {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// `<source> <params...> <destination>`. Each parameter is a preset fragment
/// such as `-define png:compression-level=9` and becomes one argv entry per
/// whitespace-separated word; nothing goes through a shell.
pub fn processor_args(source: &Path, params: &[String], destination: &Path) -> Vec<OsString> {
    let mut args = Vec::with_capacity(params.len() * 2 + 2);
    args.push(source.as_os_str().to_os_string());
    for param in params {
        args.extend(param.split_whitespace().map(OsString::from));
    }
    args.push(destination.as_os_str().to_os_string());
    args
}

#[async_trait]
impl ImageProcessor for ImageMagick {
    async fn run(
        &self,
        source: &Path,
        params: &[String],
        destination: &Path,
    ) -> Result<(), ConversionError> {
        let args = processor_args(source, params, destination);
        info!(
            program = %self.program.display(),
            args = ?args,
            "execute processor"
        );
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let started = Instant::now();
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ConversionError::Spawn {
                    program: self.program_name(),
                    source,
                });
            }
            Err(_) => {
                warn!(program = %self.program.display(), timeout = ?self.timeout, "processor timed out");
                return Err(ConversionError::TimedOut {
                    program: self.program_name(),
                    timeout: self.timeout,
                });
            }
        };
        if !output.status.success() {
            let mut diagnostics = String::from_utf8_lossy(&output.stdout).into_owned();
            diagnostics.push_str(&String::from_utf8_lossy(&output.stderr));
            let diagnostics = diagnostics.trim_end().to_string();
            warn!(
                program = %self.program.display(),
                status = ?output.status.code(),
                diagnostics = %diagnostics,
                "processor failed"
            );
            return Err(ConversionError::Failed {
                program: self.program_name(),
                status: output.status.code(),
                diagnostics,
            });
        }
        debug!(elapsed = ?started.elapsed(), "processor finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn args_split_fragments_without_shell() {
        let params = vec![
            "-define png:compression-level=9".to_string(),
            "-thumbnail 100".to_string(),
            "-strip".to_string(),
        ];
        let args = processor_args(
            Path::new("/tmp/src file.tmp"),
            &params,
            Path::new("/cache/thumb-100/a/b/x.jpg"),
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "/tmp/src file.tmp",
                "-define",
                "png:compression-level=9",
                "-thumbnail",
                "100",
                "-strip",
                "/cache/thumb-100/a/b/x.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn successful_run_returns_ok() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src.tmp");
        let destination = dir.path().join("dst.jpg");
        std::fs::write(&source, b"a").unwrap();
        std::fs::write(&destination, b"b").unwrap();
        // `cat src dst` exits 0 when both files exist.
        let processor = ImageMagick::new("cat", Duration::from_secs(5));
        processor.run(&source, &[], &destination).await.unwrap();
    }

    #[tokio::test]
    async fn failed_run_carries_diagnostics() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src.tmp");
        std::fs::write(&source, b"a").unwrap();
        let processor = ImageMagick::new("cat", Duration::from_secs(5));
        let err = processor
            .run(&source, &[], &dir.path().join("missing.jpg"))
            .await
            .unwrap_err();
        match err {
            ConversionError::Failed {
                status,
                diagnostics,
                ..
            } => {
                assert_ne!(status, Some(0));
                assert!(diagnostics.contains("missing.jpg"), "{diagnostics}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let processor = ImageMagick::new(
            dir.path().join("no-such-convert"),
            Duration::from_secs(5),
        );
        let err = processor
            .run(&dir.path().join("a"), &[], &dir.path().join("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Spawn { .. }));
    }
}
