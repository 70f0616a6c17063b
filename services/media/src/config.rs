use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the media service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Camera upload tree
    #[serde(default)]
    pub media: MediaConfig,
    /// Converted video cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// External transcoder
    #[serde(default)]
    pub transcode: TranscodeConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Read-only directory tree the camera uploads recordings to
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Root of the upload tree, one `YYYY-MM-DD` directory per day
    #[serde(default = "default_media_root")]
    pub root: PathBuf,
}

/// Converted video cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory owned by the cache
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Byte budget enforced after every conversion
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
}

/// Transcoder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeConfig {
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Kill the transcoder after this many seconds
    #[serde(default = "default_transcode_timeout_secs")]
    pub timeout_secs: u64,
    /// Arguments placed between the input and the output path
    #[serde(default = "default_output_args")]
    pub output_args: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_media_root() -> PathBuf {
    PathBuf::from("/media/camera")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/video_cache")
}

fn default_cache_max_bytes() -> u64 {
    20 * 1024 * 1024 * 1024 // 20GB
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_transcode_timeout_secs() -> u64 {
    120
}

/// H.264 baseline with AAC audio and the index up front, playable by any browser.
fn default_output_args() -> Vec<String> {
    [
        "-c:v", "libx264", "-profile:v", "baseline", "-level", "3.1",
        "-pix_fmt", "yuv420p",
        "-b:v", "1500k", "-maxrate", "2000k", "-bufsize", "3000k",
        "-c:a", "aac", "-b:a", "128k", "-ac", "2",
        "-movflags", "+faststart",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = config::Config::builder()
            // Add config files if present
            .add_source(config::File::with_name("config/media").required(false))
            .add_source(
                config::File::with_name(&format!("config/media.{}", run_mode)).required(false),
            )
            // Override with environment variables
            // MEDIA__CACHE__MAX_BYTES -> cache.max_bytes
            .add_source(
                config::Environment::with_prefix("MEDIA")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("transcode.output_args")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Reject settings the cache cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.max_bytes == 0 {
            anyhow::bail!("cache.max_bytes must be greater than 0");
        }
        if self.transcode.ffmpeg_path.is_empty() {
            anyhow::bail!("transcode.ffmpeg_path must not be empty");
        }
        if self.transcode.timeout_secs == 0 {
            anyhow::bail!("transcode.timeout_secs must be greater than 0");
        }
        if self.media.root == self.cache.dir {
            anyhow::bail!("cache.dir must differ from media.root");
        }
        Ok(())
    }
}

impl TranscodeConfig {
    /// Get transcoder timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            timeout_secs: default_transcode_timeout_secs(),
            output_args: default_output_args(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.cache.max_bytes, 21_474_836_480);
        assert_eq!(config.transcode.timeout(), Duration::from_secs(120));
        assert!(config.transcode.output_args.contains(&"+faststart".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut config = Config::default();
        config.cache.max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_dir_same_as_media_root_rejected() {
        let mut config = Config::default();
        config.cache.dir = config.media.root.clone();
        assert!(config.validate().is_err());
    }
}
