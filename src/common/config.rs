// Configuration types and parsing

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::error::{Error, Result};
use crate::common::types::{
    DEFAULT_DL_TIMEOUT, DEFAULT_MAX_SHARED_MEMORY, DEFAULT_UPDATE_INTERVAL, MAX_DEFAULT_WORKERS,
};

/// Runtime configuration for an install run.
///
/// The cache directory holds the shared chunk arena file and defaults to
/// `.cache` inside the download directory.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub download_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub base_url: String,
    pub max_workers: usize,
    pub dl_timeout: Duration,
    pub max_shared_memory: u64,
    pub update_interval: Duration,
    pub bind_addrs: Vec<String>,
    pub resume_file: Option<PathBuf>,
    /// Per-chunk retry cap; `None` retries failed downloads indefinitely.
    pub max_retries_per_chunk: Option<u32>,
}

impl InstallConfig {
    pub fn new(download_dir: impl AsRef<Path>, base_url: impl Into<String>) -> Self {
        let download_dir = download_dir.as_ref().to_path_buf();
        Self {
            cache_dir: download_dir.join(".cache"),
            download_dir,
            base_url: base_url.into(),
            max_workers: (num_cpus::get() * 2).min(MAX_DEFAULT_WORKERS),
            dl_timeout: DEFAULT_DL_TIMEOUT,
            max_shared_memory: DEFAULT_MAX_SHARED_MEMORY,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            bind_addrs: Vec::new(),
            resume_file: None,
            max_retries_per_chunk: None,
        }
    }

    pub fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cache_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::ConfigError(
                "Worker count must be at least 1".to_string(),
            ));
        }
        self.max_workers = workers;
        Ok(self)
    }

    pub fn with_dl_timeout(mut self, timeout: Duration) -> Self {
        self.dl_timeout = timeout;
        self
    }

    pub fn with_max_shared_memory(mut self, bytes: u64) -> Result<Self> {
        if bytes == 0 {
            return Err(Error::ConfigError(
                "Shared memory size must be non-zero".to_string(),
            ));
        }
        self.max_shared_memory = bytes;
        Ok(self)
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_bind_addrs(mut self, addrs: Vec<String>) -> Self {
        self.bind_addrs = addrs;
        self
    }

    pub fn with_resume_file(mut self, path: impl AsRef<Path>) -> Self {
        self.resume_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries_per_chunk = Some(retries);
        self
    }
}
