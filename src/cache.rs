use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Trailing bytes of an identifier skipped before taking the shard
/// characters: a separator plus a four character extension.
pub const IDENTIFIER_SUFFIX_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("identifier {identifier:?} is too short to shard")]
    IdentifierTooShort { identifier: String },
    #[error("identifier {identifier:?} is not ascii")]
    NonAsciiIdentifier { identifier: String },
    #[error("failed to create directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy {} to {}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to move {} to {}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The two characters right before the identifier's extension suffix.
/// Identifiers must be ASCII and longer than the suffix plus one byte.
pub fn shard_prefix(identifier: &str) -> Result<(char, char), StorageError> {
    if !identifier.is_ascii() {
        return Err(StorageError::NonAsciiIdentifier {
            identifier: identifier.to_string(),
        });
    }
    let bytes = identifier.as_bytes();
    if bytes.len() <= IDENTIFIER_SUFFIX_LEN {
        return Err(StorageError::IdentifierTooShort {
            identifier: identifier.to_string(),
        });
    }
    let n = bytes.len() - IDENTIFIER_SUFFIX_LEN;
    Ok((bytes[n - 1] as char, bytes[n] as char))
}

/// `{root}/{transformation}/{c1}/{c2}/{identifier}`; depends on nothing but
/// its arguments.
pub fn cache_path(
    root: &Path,
    transformation: &str,
    identifier: &str,
) -> Result<PathBuf, StorageError> {
    let (first, second) = shard_prefix(identifier)?;
    Ok(root
        .join(transformation)
        .join(first.to_string())
        .join(second.to_string())
        .join(identifier))
}

/// Sibling of `destination` that a conversion writes before it is moved into
/// place. The file name keeps the destination's extension, which the
/// processor uses to pick the output format.
pub fn staging_path(destination: &Path, nonce: u64) -> PathBuf {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{nonce:016x}.{name}"))
}

pub async fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::create_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(source) => Err(StorageError::CreateDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Coalesces concurrent conversions of the same cache path inside one
/// process. The first caller leads; later callers wait for the leader's
/// permit to drop.
#[derive(Clone, Default)]
pub struct ConversionSingleflight {
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl ConversionSingleflight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> ConversionPermit {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                ConversionPermit::waiter(self.inner.clone(), entry.get().clone(), key.to_string())
            }
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(notify.clone());
                ConversionPermit::leader(self.inner.clone(), notify, key.to_string())
            }
        }
    }
}

pub struct ConversionPermit {
    key: String,
    notify: Arc<Notify>,
    is_leader: bool,
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl ConversionPermit {
    fn leader(inner: Arc<DashMap<String, Arc<Notify>>>, notify: Arc<Notify>, key: String) -> Self {
        Self {
            key,
            notify,
            is_leader: true,
            inner,
        }
    }

    fn waiter(inner: Arc<DashMap<String, Arc<Notify>>>, notify: Arc<Notify>, key: String) -> Self {
        Self {
            key,
            notify,
            is_leader: false,
            inner,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Returns false when the leader is still running after `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> bool {
        if self.is_leader {
            return true;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let leader_running = self
            .inner
            .get(&self.key)
            .map(|entry| Arc::ptr_eq(entry.value(), &self.notify))
            .unwrap_or(false);
        if !leader_running {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }
}

impl Drop for ConversionPermit {
    fn drop(&mut self) {
        if !self.is_leader {
            return;
        }
        if let Some((_, notify)) = self.inner.remove(&self.key) {
            notify.notify_waiters();
        }
    }
}
