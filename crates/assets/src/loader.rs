//! Asset loaders: where bytes actually come from.
//!
//! The resolver only sees the [`AssetLoader`] trait. Implementations:
//! - [`FilesystemLoader`]: paths relative to a local asset root
//! - [`HttpLoader`]: absolute URLs, or paths relative to a base URL
//! - [`SchemeLoader`]: routes `http(s)://` locations to one loader and the
//!   rest to another
//! - [`MemoryLoader`]: in-memory payloads with scriptable failures

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use catalog::SourceLocation;
use parking_lot::Mutex;

use crate::error::LoadError;

/// Type alias for a boxed future that can be sent between threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Loads the raw bytes behind a [`SourceLocation`].
///
/// Implementations must be `Send + Sync` for use across worker tasks and
/// classify failures so the retry layer can tell transient from terminal.
pub trait AssetLoader: Send + Sync {
    fn load<'a>(&'a self, location: &'a SourceLocation) -> BoxFuture<'a, Result<Bytes, LoadError>>;
}

/// Reads assets from a directory tree.
pub struct FilesystemLoader {
    root: PathBuf,
}

impl FilesystemLoader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Joins a relative location onto the root. Absolute paths and `..`
    /// segments are refused.
    fn path_for(&self, location: &SourceLocation) -> Option<PathBuf> {
        let rel = Path::new(location.as_str());
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(self.root.join(rel))
    }
}

impl AssetLoader for FilesystemLoader {
    fn load<'a>(&'a self, location: &'a SourceLocation) -> BoxFuture<'a, Result<Bytes, LoadError>> {
        Box::pin(async move {
            let Some(path) = self.path_for(location) else {
                return Err(LoadError::NotFound(location.to_string()));
            };
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(LoadError::NotFound(location.to_string()))
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    Err(LoadError::NotFound(format!("{location}: {e}")))
                }
                Err(e) => Err(LoadError::Transient(format!("{location}: {e}"))),
            }
        })
    }
}

/// Fetches assets over HTTP(S).
pub struct HttpLoader {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    /// Relative locations are resolved against `base_url`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn url_for(&self, location: &SourceLocation) -> Option<String> {
        if location.is_remote() {
            return Some(location.to_string());
        }
        let base = self.base_url.as_deref()?;
        Some(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            location.as_str().trim_start_matches('/')
        ))
    }
}

impl AssetLoader for HttpLoader {
    fn load<'a>(&'a self, location: &'a SourceLocation) -> BoxFuture<'a, Result<Bytes, LoadError>> {
        Box::pin(async move {
            let Some(url) = self.url_for(location) else {
                return Err(LoadError::NotFound(format!("{location}: no base url")));
            };

            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| LoadError::Transient(format!("{url}: {e}")))?;

            let status = resp.status();
            if status.is_server_error()
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                return Err(LoadError::Transient(format!("{url}: HTTP {status}")));
            }
            if !status.is_success() {
                return Err(LoadError::NotFound(format!("{url}: HTTP {status}")));
            }

            resp.bytes()
                .await
                .map_err(|e| LoadError::Transient(format!("{url}: {e}")))
        })
    }
}

/// Routes remote URLs to `remote` and everything else to `local`.
pub struct SchemeLoader {
    local: Arc<dyn AssetLoader>,
    remote: Arc<dyn AssetLoader>,
}

impl SchemeLoader {
    pub fn new(local: Arc<dyn AssetLoader>, remote: Arc<dyn AssetLoader>) -> Self {
        Self { local, remote }
    }
}

impl AssetLoader for SchemeLoader {
    fn load<'a>(&'a self, location: &'a SourceLocation) -> BoxFuture<'a, Result<Bytes, LoadError>> {
        if location.is_remote() {
            self.remote.load(location)
        } else {
            self.local.load(location)
        }
    }
}

#[derive(Default)]
struct MemoryState {
    payloads: HashMap<SourceLocation, Bytes>,
    scripted: HashMap<SourceLocation, VecDeque<LoadError>>,
    always: HashMap<SourceLocation, LoadError>,
    attempts: HashMap<SourceLocation, u32>,
}

/// In-memory loader for embedded placeholder packs and tests.
///
/// Failures can be scripted per location: a queue of errors consumed one per
/// attempt, or a permanent error. Every attempt is counted.
#[derive(Default)]
pub struct MemoryLoader {
    state: Mutex<MemoryState>,
    delay: Duration,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every load waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn insert(&self, location: impl Into<SourceLocation>, payload: impl Into<Bytes>) {
        self.state
            .lock()
            .payloads
            .insert(location.into(), payload.into());
    }

    /// The next `times` loads of `location` fail with `error`.
    pub fn fail_times(&self, location: impl Into<SourceLocation>, times: usize, error: LoadError) {
        let mut state = self.state.lock();
        let queue = state.scripted.entry(location.into()).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Every load of `location` fails with `error`.
    pub fn fail_always(&self, location: impl Into<SourceLocation>, error: LoadError) {
        self.state.lock().always.insert(location.into(), error);
    }

    pub fn attempts(&self, location: &SourceLocation) -> u32 {
        self.state.lock().attempts.get(location).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.state.lock().attempts.values().sum()
    }

    fn answer(&self, location: &SourceLocation) -> Result<Bytes, LoadError> {
        let mut state = self.state.lock();
        *state.attempts.entry(location.clone()).or_insert(0) += 1;

        if let Some(err) = state
            .scripted
            .get_mut(location)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        if let Some(err) = state.always.get(location) {
            return Err(err.clone());
        }
        state
            .payloads
            .get(location)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(location.to_string()))
    }
}

impl AssetLoader for MemoryLoader {
    fn load<'a>(&'a self, location: &'a SourceLocation) -> BoxFuture<'a, Result<Bytes, LoadError>> {
        Box::pin(async move {
            let result = self.answer(location);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            result
        })
    }
}
