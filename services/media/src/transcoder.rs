use crate::config::TranscodeConfig;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Bytes of stderr kept in a failure message
const STDERR_TAIL: usize = 500;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Failed to start transcoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Transcoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Transcoder timed out after {0}s")]
    Timeout(u64),

    #[error("Transcoder produced no output")]
    EmptyOutput,
}

/// Converts a camera recording into a browser-playable file.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Write a converted copy of `input` to `output`.
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), TranscodeError>;
}

/// Runs an ffmpeg executable.
pub struct FfmpegTranscoder {
    binary: String,
    output_args: Vec<String>,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            binary: config.ffmpeg_path.clone(),
            output_args: config.output_args.clone(),
            timeout: config.timeout(),
        }
    }

    fn command_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.into()];
        args.extend(self.output_args.iter().map(OsString::from));
        args.push(output.into());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        debug!(input = %input.display(), output = %output.display(), "Starting ffmpeg");

        // Dropping the child on timeout kills ffmpeg
        let child = Command::new(&self.binary)
            .args(self.command_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TranscodeError::Spawn)?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(TranscodeError::Spawn(e)),
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    input = %input.display(),
                    "ffmpeg timeout, process killed"
                );
                return Err(TranscodeError::Timeout(self.timeout.as_secs()));
            }
        };

        if !result.status.success() {
            return Err(TranscodeError::Failed {
                status: result.status.to_string(),
                stderr: stderr_tail(&result.stderr),
            });
        }

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(TranscodeError::EmptyOutput),
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let mut start = text.len().saturating_sub(STDERR_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args_wrap_output_args() {
        let transcoder = FfmpegTranscoder::new(&TranscodeConfig::default());
        let args = transcoder.command_args(Path::new("/in/a.dav"), Path::new("/out/a.mp4"));

        assert_eq!(args[0], "-y");
        assert_eq!(args[1], "-i");
        assert_eq!(args[2], "/in/a.dav");
        assert_eq!(args[3], "-c:v");
        assert_eq!(args.last().unwrap(), "/out/a.mp4");
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let long = "x".repeat(2000) + "final error";
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.len(), STDERR_TAIL);
        assert!(tail.ends_with("final error"));

        assert_eq!(stderr_tail(b"  short \n"), "short");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let config = TranscodeConfig {
            ffmpeg_path: "/nonexistent/ffmpeg-binary".to_string(),
            ..TranscodeConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let result = FfmpegTranscoder::new(&config)
            .transcode(&dir.path().join("in.dav"), &dir.path().join("out.mp4"))
            .await;
        assert!(matches!(result, Err(TranscodeError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let config = TranscodeConfig {
            ffmpeg_path: "false".to_string(),
            ..TranscodeConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let result = FfmpegTranscoder::new(&config)
            .transcode(&dir.path().join("in.dav"), &dir.path().join("out.mp4"))
            .await;
        assert!(matches!(result, Err(TranscodeError::Failed { .. })));
    }
}
