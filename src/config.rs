//! Engine configuration
//!
//! Policy knobs for the download engine plus HTTP client construction.

use crate::error::{DownloadError, Result};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default range size: 5 MiB per chunk.
pub const DEFAULT_RANGE_SIZE: u64 = 5 * 1024 * 1024;

/// Default number of ranges/segments transferring concurrently per task.
pub const DEFAULT_RANGE_CONCURRENCY: usize = 5;

/// Default number of tasks transferring concurrently across the hub.
pub const DEFAULT_MAX_TASK: usize = 3;

/// Configuration for the download engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Force [`NormalDownloader`](crate::downloader::NormalDownloader) even
    /// when the server advertises range support
    pub disable_range_download: bool,

    /// Extra headers sent with every request
    pub custom_headers: Vec<(String, String)>,

    /// Bytes per range for segmented downloads
    pub range_size: u64,

    /// Concurrent ranges/segments per task
    pub range_concurrency: usize,

    /// Concurrent tasks across the whole hub
    pub max_task: usize,

    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read inactivity timeout in seconds; does not bound total transfer time
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            disable_range_download: false,
            custom_headers: Vec::new(),
            range_size: DEFAULT_RANGE_SIZE,
            range_concurrency: DEFAULT_RANGE_CONCURRENCY,
            max_task: DEFAULT_MAX_TASK,
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
            user_agent: format!("mizu-dl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DownloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable byte-range downloads entirely
    pub fn disable_range_download(mut self, disable: bool) -> Self {
        self.disable_range_download = disable;
        self
    }

    /// Add a custom header sent with every request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.push((name.into(), value.into()));
        self
    }

    /// Set the range size in bytes
    pub fn range_size(mut self, size: u64) -> Self {
        self.range_size = size;
        self
    }

    /// Set per-task range concurrency
    pub fn range_concurrency(mut self, n: usize) -> Self {
        self.range_concurrency = n;
        self
    }

    /// Set hub-wide concurrent task limit
    pub fn max_task(mut self, n: usize) -> Self {
        self.max_task = n;
        self
    }

    /// Set the connection timeout in seconds
    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout = secs;
        self
    }

    /// Set the read inactivity timeout in seconds
    pub fn read_timeout(mut self, secs: u64) -> Self {
        self.read_timeout = secs;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.range_size == 0 {
            return Err(DownloadError::invalid_input(
                "range_size",
                "Must be at least 1 byte",
            ));
        }
        if self.range_concurrency == 0 {
            return Err(DownloadError::invalid_input(
                "range_concurrency",
                "Must be at least 1",
            ));
        }
        if self.max_task == 0 {
            return Err(DownloadError::invalid_input(
                "max_task",
                "Must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Pluggable HTTP client construction.
pub trait HttpClientFactory: Send + Sync {
    fn create(&self, config: &DownloadConfig) -> Result<Client>;
}

/// Default client factory: timeouts, redirect limit and connection pooling
/// from the config.
///
/// `read_timeout` is an inactivity timeout between reads, not a cap on the
/// whole request; long transfers stay alive as long as bytes keep flowing.
#[derive(Debug, Default)]
pub struct DefaultClientFactory;

impl HttpClientFactory for DefaultClientFactory {
    fn create(&self, config: &DownloadConfig) -> Result<Client> {
        Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .read_timeout(Duration::from_secs(config.read_timeout))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DownloadError::Internal(format!("Failed to create HTTP client: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DownloadConfig::default();
        assert_eq!(config.range_size, DEFAULT_RANGE_SIZE);
        assert_eq!(config.range_concurrency, DEFAULT_RANGE_CONCURRENCY);
        assert_eq!(config.max_task, DEFAULT_MAX_TASK);
        assert!(!config.disable_range_download);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_builder() {
        let config = DownloadConfig::new()
            .range_size(2 * 1024 * 1024)
            .range_concurrency(4)
            .max_task(8)
            .connect_timeout(10)
            .read_timeout(20)
            .header("Referer", "https://example.com")
            .disable_range_download(true);

        assert_eq!(config.range_size, 2 * 1024 * 1024);
        assert_eq!(config.range_concurrency, 4);
        assert_eq!(config.max_task, 8);
        assert_eq!(config.connect_timeout, 10);
        assert_eq!(config.read_timeout, 20);
        assert_eq!(config.custom_headers.len(), 1);
        assert!(config.disable_range_download);
    }

    #[test]
    fn zero_limits_rejected() {
        assert!(DownloadConfig::new().range_size(0).validate().is_err());
        assert!(DownloadConfig::new().range_concurrency(0).validate().is_err());
        assert!(DownloadConfig::new().max_task(0).validate().is_err());
    }

    #[test]
    fn default_factory_builds_client() {
        let config = DownloadConfig::default();
        assert!(DefaultClientFactory.create(&config).is_ok());
    }
}
