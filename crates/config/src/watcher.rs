//! Hot reload: poll the config file and hand fresh configs to a callback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{AppConfig, ConfigError};

/// Variable lookup used for `CTXGATE_*` overrides.
type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Watches one config file by polling its metadata and content.
///
/// A change is reported only when the content actually differs from the
/// last successfully parsed version. Files that fail to parse or validate
/// are logged and skipped; the previous config stays in effect. Every
/// reloaded config gets the same environment overrides as startup.
pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    overrides: Lookup,
    last_modified: Option<SystemTime>,
    last_len: Option<u64>,
    last_content: Option<String>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            overrides: Arc::new(|key| std::env::var(key).ok()),
            last_modified: None,
            last_len: None,
            last_content: None,
        }
    }

    /// Read overrides from `lookup` instead of the process environment.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.overrides = Arc::new(lookup);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One poll step. Returns the new config when the file changed.
    pub async fn check(&mut self) -> Result<Option<AppConfig>, ConfigError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            // A missing file is not a change
            Err(_) => return Ok(None),
        };
        let modified = metadata.modified().ok();
        let len = metadata.len();
        if self.last_content.is_some()
            && modified == self.last_modified
            && Some(len) == self.last_len
        {
            return Ok(None);
        }

        let content =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| ConfigError::ReadError {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })?;

        if self.last_content.as_deref() == Some(content.as_str()) {
            self.last_modified = modified;
            self.last_len = Some(len);
            return Ok(None);
        }

        let mut config = AppConfig::from_toml_str(&content, &self.path)?;
        config.apply_overrides(|key| (self.overrides)(key));
        config.validate()?;
        self.last_modified = modified;
        self.last_len = Some(len);
        self.last_content = Some(content);
        Ok(Some(config))
    }

    /// Start polling in the background.
    ///
    /// The file's current content is taken as the baseline; only later
    /// changes reach `on_reload`.
    pub fn spawn<F>(mut self, on_reload: F) -> WatchHandle
    where
        F: Fn(AppConfig) + Send + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            if let Err(e) = self.check().await {
                warn!(path = %self.path.display(), error = %e, "Initial config read failed");
            }
            info!(path = %self.path.display(), "Config watcher started");

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.check().await {
                    Ok(Some(config)) => {
                        info!(path = %self.path.display(), "Config change detected, reloading");
                        on_reload(config);
                    }
                    Ok(None) => debug!("Config unchanged"),
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "Ignoring invalid config")
                    }
                }
            }
        });
        WatchHandle { task }
    }
}

/// Stops the background watcher when dropped.
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {
        // Drop aborts
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
        info!("Config watcher stopped");
    }
}
