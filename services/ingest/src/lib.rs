//! TrafficStats camera event listener.
//!
//! Keeps a long-lived subscription to a network camera's alarm stream and
//! turns the IVS alarms it pushes into typed events.
//!
//! ## Architecture
//!
//! ```text
//! Camera ──HTTP multipart──▶ ConnectionSupervisor ──bytes──▶ MultipartParser
//!                                    │                            │
//!                                    │◀────────RawEventFrame──────┘
//!                                    ▼
//!                             EventClassifier ──DomainEvent──▶ EventSink
//! ```
//!
//! The supervisor reconnects with exponential backoff whenever the stream
//! fails, and never lets an error escape: the camera may reboot at any time
//! and the listener is expected to outlive it.

pub mod classifier;
pub mod config;
pub mod digest;
pub mod multipart;
pub mod recorder;
pub mod sink;
pub mod supervisor;

pub use classifier::{DomainEvent, EventClassifier, EventKind, MediaRef, TimestampSource};
pub use config::IngestConfig;
pub use multipart::{FrameError, MultipartParser, RawEventFrame};
pub use sink::{ChannelSink, EventSink, IntrusionDebounce, MemorySink, SinkError};
pub use supervisor::{ConnectionState, ConnectionSupervisor, ListenerError, ListenerStatus, StreamStats};
