//! TrafficStats media service.
//!
//! Serves the camera's uploaded recordings to the dashboard. Recordings are
//! stored in the camera's native container, which browsers cannot play, so
//! they are converted on demand and kept in a size-bounded cache.
//!
//! ```text
//! request ──▶ MediaRoot::resolve ──▶ VideoCacheManager ──hit──▶ cached .mp4
//!                                            │
//!                                          miss
//!                                            ▼
//!                                ConversionLocks ──owner──▶ Transcoder
//! ```
//!
//! [`media_match`] pairs alarm events with the snapshot and recording
//! uploaded around the same time.

pub mod config;
pub mod conversion_lock;
pub mod error;
pub mod media_match;
pub mod media_path;
pub mod transcoder;
pub mod video_cache;

pub use conversion_lock::{Acquired, ConversionGuard, ConversionLocks, WaitHandle};
pub use error::{MediaError, Result};
pub use media_match::{DateDirectory, MediaMatch};
pub use media_path::{MediaIdentifier, MediaRoot};
pub use transcoder::{FfmpegTranscoder, TranscodeError, Transcoder};
pub use video_cache::{CacheEntry, CacheStats, VideoCacheManager};
