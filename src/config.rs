use std::path::PathBuf;
use std::time::Duration;

/// Where the default logger writes when no path has been set.
pub const DEFAULT_OUTPUT_PATH: &str = "./compressedLog";

/// Bytes of staging space each logging thread gets.
pub const DEFAULT_STAGING_BUFFER_SIZE: usize = 1 << 20;

/// How long the background writer sleeps when every ring is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Uncompressed bytes per data block before the batch is split.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1 << 20;

/// Failed push attempts a producer spins through before it starts yielding.
pub const BACKPRESSURE_SPIN_LIMIT: u32 = 1_000;

/// Longest single sleep of a producer waiting for staging space.
pub const BACKPRESSURE_MAX_SLEEP: Duration = Duration::from_micros(100);

/// Settings for one [`Logger`](crate::Logger).
///
/// ```
/// # use nanolog::LoggerConfig;
/// # use std::time::Duration;
/// let config = LoggerConfig::default()
///     .with_output_path("/tmp/app.nlog")
///     .with_staging_buffer_size(64 * 1024)
///     .with_poll_interval(Duration::from_millis(5));
/// assert_eq!(config.staging_buffer_size, 64 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerConfig {
    pub output_path: PathBuf,
    /// Staging ring size for threads that start logging after this is set.
    pub staging_buffer_size: usize,
    pub poll_interval: Duration,
    pub max_block_size: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            staging_buffer_size: DEFAULT_STAGING_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }
}

impl LoggerConfig {
    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    pub fn with_staging_buffer_size(mut self, bytes: usize) -> Self {
        self.staging_buffer_size = bytes;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes.max(1);
        self
    }
}
