//! Camera connection supervisor with automatic reconnection.
//!
//! Owns the alarm stream's lifecycle: subscribe, authenticate, stream,
//! detect failure, back off and reconnect. Bytes read from the socket go to
//! the multipart parser, frames go to the classifier and interesting events
//! go to the sink. No error escapes the loop; the listener stays up until
//! it is cancelled.

use crate::classifier::{DomainEvent, EventClassifier};
use crate::config::{AuthScheme, CameraConfig, ConfigValidationError};
use crate::digest::{client_nonce, DigestChallenge};
use crate::multipart::{boundary_from_content_type, FrameError, MultipartParser, ParserLimits, RawEventFrame};
use crate::sink::EventSink;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode, Url};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Replay keys remembered from earlier connections.
const DELIVERED_WINDOW: usize = 1024;

/// Errors that end a single connection attempt.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid listener configuration: {0}")]
    Config(#[from] ConfigValidationError),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Camera rejected credentials (HTTP {status})")]
    Authentication { status: u16 },

    #[error("Malformed stream: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("Camera closed the event stream")]
    StreamClosed,
}

/// State of the camera connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Streaming,
    Backoff,
}

impl ConnectionState {
    /// Whether the supervisor may move from `self` to `next`.
    ///
    /// Any state may return to `Disconnected` on shutdown.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Authenticated)
                | (Connecting, Backoff)
                | (Authenticated, Streaming)
                | (Authenticated, Backoff)
                | (Streaming, Backoff)
                | (Backoff, Connecting)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Statistics for the alarm stream.
#[derive(Debug, Default, Clone)]
pub struct StreamStats {
    pub frames_received: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub duplicates_suppressed: u64,
    pub bytes_received: u64,
    pub reconnect_count: u32,
    pub auth_failures: u32,
    pub last_event_at: Option<DateTime<Utc>>,
    pub streaming_since: Option<DateTime<Utc>>,
}

/// Read-only view of a running listener, cheap to clone.
#[derive(Debug, Clone)]
pub struct ListenerStatus {
    state: Arc<RwLock<ConnectionState>>,
    stats: Arc<RwLock<StreamStats>>,
}

impl ListenerStatus {
    fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            stats: Arc::new(RwLock::new(StreamStats::default())),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Get current stream statistics.
    pub fn stats(&self) -> StreamStats {
        self.stats.read().clone()
    }

    /// True while events are flowing.
    pub fn is_streaming(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }
}

/// Identities of events delivered on earlier connections.
///
/// Keys from the live connection are only checked once it ends, so two
/// identical events on one connection are both delivered.
#[derive(Debug)]
struct DeliveredWindow {
    capacity: usize,
    previous: HashSet<String>,
    order: VecDeque<String>,
    /// Most recent keys of the live connection, at most `capacity`
    current: VecDeque<String>,
}

impl DeliveredWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            previous: HashSet::new(),
            order: VecDeque::new(),
            current: VecDeque::new(),
        }
    }

    fn is_replay(&self, key: &str) -> bool {
        self.previous.contains(key)
    }

    fn record(&mut self, key: String) {
        if self.current.len() >= self.capacity {
            self.current.pop_front();
        }
        self.current.push_back(key);
    }

    fn end_session(&mut self) {
        for key in self.current.drain(..) {
            if self.previous.insert(key.clone()) {
                self.order.push_back(key);
            }
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.previous.remove(&oldest);
            }
        }
    }
}

/// Supervises the camera's alarm stream for the lifetime of the process.
pub struct ConnectionSupervisor<S: EventSink> {
    config: CameraConfig,
    url: Url,
    classifier: EventClassifier,
    sink: S,
    client: reqwest::Client,
    status: ListenerStatus,
    delivered: DeliveredWindow,
    backoff: ExponentialBackoff,
    nonce_count: u32,
}

impl<S: EventSink> ConnectionSupervisor<S> {
    /// Create a supervisor. Fails fast on unusable configuration.
    pub fn new(
        config: CameraConfig,
        classifier: EventClassifier,
        sink: S,
    ) -> Result<Self, ListenerError> {
        config.validate()?;

        let url = Url::parse(&config.event_url()).map_err(|e| {
            ConfigValidationError::InvalidValue {
                field: "camera.host".to_string(),
                message: e.to_string(),
            }
        })?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout())
            .no_proxy()
            .build()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "camera".to_string(),
                message: e.to_string(),
            })?;

        let backoff = ExponentialBackoff {
            current_interval: config.reconnect_base_delay(),
            initial_interval: config.reconnect_base_delay(),
            max_interval: config.reconnect_max_delay(),
            multiplier: 2.0,
            randomization_factor: config.reconnect_jitter,
            max_elapsed_time: None,
            ..Default::default()
        };

        Ok(Self {
            config,
            url,
            classifier,
            sink,
            client,
            status: ListenerStatus::new(),
            delivered: DeliveredWindow::new(DELIVERED_WINDOW),
            backoff,
            nonce_count: 0,
        })
    }

    /// Handle for observing the listener while it runs.
    pub fn status(&self) -> ListenerStatus {
        self.status.clone()
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) -> StreamStats {
        info!(
            host = %self.config.host,
            codes = ?self.config.event_codes,
            "Starting camera event listener"
        );

        while !shutdown.is_cancelled() {
            self.transition(ConnectionState::Connecting);
            let result = self.run_session(&shutdown).await;
            self.delivered.end_session();

            let err = match result {
                Ok(()) => break,
                Err(e) => e,
            };
            if shutdown.is_cancelled() {
                break;
            }

            self.report_failure(&err);
            self.transition(ConnectionState::Backoff);

            let delay = self.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.status.stats.write().reconnect_count += 1;
        }

        self.transition(ConnectionState::Disconnected);
        let stats = self.status.stats();
        info!(
            frames = stats.frames_received,
            events = stats.events_delivered,
            reconnects = stats.reconnect_count,
            "Camera event listener stopped"
        );
        stats
    }

    /// One connection attempt. Returns `Ok` only when shutdown was requested.
    async fn run_session(&mut self, shutdown: &CancellationToken) -> Result<(), ListenerError> {
        let response = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            response = self.open_stream() => response?,
        };
        self.transition(ConnectionState::Authenticated);

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let boundary = boundary_from_content_type(&content_type)?;
        debug!(boundary = %boundary, "Subscribed to alarm stream");

        let mut parser = MultipartParser::new(
            &boundary,
            ParserLimits {
                max_part_bytes: self.config.max_part_bytes,
                boundary_window: self.config.boundary_window_bytes,
            },
        );
        let mut body = Box::pin(response.bytes_stream());

        loop {
            let wait = if parser.has_pending() {
                self.config.attachment_grace()
            } else {
                self.config.idle_timeout()
            };

            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush(&mut parser);
                    return Ok(());
                }
                next = timeout(wait, body.next()) => next,
            };

            match next {
                Err(_) if parser.has_pending() => self.flush(&mut parser),
                Err(_) => {
                    return Err(ListenerError::TransientNetwork(format!(
                        "no data from camera for {}s",
                        self.config.idle_timeout_secs
                    )));
                }
                Ok(None) => {
                    for frame in parser.finish() {
                        self.deliver(frame);
                    }
                    return Err(ListenerError::StreamClosed);
                }
                Ok(Some(Err(e))) => {
                    self.flush(&mut parser);
                    return Err(ListenerError::TransientNetwork(e.to_string()));
                }
                Ok(Some(Ok(chunk))) => {
                    self.status.stats.write().bytes_received += chunk.len() as u64;
                    parser.push(&chunk);

                    loop {
                        let frame = match parser.next_frame() {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break,
                            Err(e) => {
                                self.flush(&mut parser);
                                return Err(e.into());
                            }
                        };
                        self.mark_streaming(&parser);
                        self.deliver(frame);
                    }
                    self.mark_streaming(&parser);

                    if parser.is_closed() {
                        self.flush(&mut parser);
                        return Err(ListenerError::StreamClosed);
                    }
                }
            }
        }
    }

    /// Send the subscription request, answering a Digest challenge once.
    async fn open_stream(&mut self) -> Result<Response, ListenerError> {
        let response = self.send(None).await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && self.config.auth_scheme == AuthScheme::Digest
        {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(DigestChallenge::parse);

            match challenge {
                Some(Ok(challenge)) => {
                    self.nonce_count = self.nonce_count.wrapping_add(1);
                    let header = challenge.authorization(
                        &self.config.username,
                        &self.config.password,
                        "GET",
                        &request_uri(&self.url),
                        &client_nonce(self.nonce_count),
                        self.nonce_count,
                    );
                    let response = self.send(Some(header)).await?;
                    return check_status(response);
                }
                Some(Err(e)) => warn!(error = %e, "Unusable authentication challenge"),
                None => warn!("Camera sent 401 without a challenge"),
            }
        }

        check_status(response)
    }

    async fn send(&self, authorization: Option<String>) -> Result<Response, ListenerError> {
        let mut request = self.client.get(self.url.clone());
        request = match (authorization, self.config.auth_scheme) {
            (Some(header), _) => request.header(AUTHORIZATION, header),
            (None, AuthScheme::Basic) => {
                request.basic_auth(&self.config.username, Some(&self.config.password))
            }
            (None, AuthScheme::Digest) => request,
        };

        match timeout(self.config.connection_timeout(), request.send()).await {
            Err(_) => Err(ListenerError::TransientNetwork(format!(
                "no response within {}s",
                self.config.connection_timeout_secs
            ))),
            Ok(Err(e)) => Err(ListenerError::TransientNetwork(e.to_string())),
            Ok(Ok(response)) => Ok(response),
        }
    }

    fn mark_streaming(&mut self, parser: &MultipartParser) {
        if parser.boundary_seen() && self.status.state() == ConnectionState::Authenticated {
            self.transition(ConnectionState::Streaming);
            self.backoff.reset();
            self.status.stats.write().streaming_since = Some(Utc::now());
        }
    }

    fn flush(&mut self, parser: &mut MultipartParser) {
        if let Some(frame) = parser.flush_pending() {
            self.deliver(frame);
        }
    }

    /// Classify a frame and hand interesting events to the sink.
    fn deliver(&mut self, frame: RawEventFrame) {
        let event = self.classifier.classify(&frame, Utc::now());
        self.status.stats.write().frames_received += 1;

        if event.is_ignored() {
            trace!(code = %event.code, bytes = frame.raw_len, "Ignoring frame");
            return;
        }

        if let Some(key) = event.replay_key() {
            if self.delivered.is_replay(&key) {
                self.status.stats.write().duplicates_suppressed += 1;
                debug!(key = %key, "Suppressing event replayed after reconnect");
                return;
            }
            self.delivered.record(key);
        }

        self.emit(event);
    }

    fn emit(&self, event: DomainEvent) {
        let kind = event.kind;
        let rule = event.rule_name.clone();
        let timestamp = event.timestamp;

        match self.sink.on_event(event) {
            Ok(()) => {
                let mut stats = self.status.stats.write();
                stats.events_delivered += 1;
                stats.last_event_at = Some(timestamp);
                debug!(kind = ?kind, rule = %rule, timestamp = %timestamp, "Event delivered");
            }
            Err(e) => {
                self.status.stats.write().events_dropped += 1;
                warn!(kind = ?kind, rule = %rule, error = %e, "Sink did not accept event");
            }
        }
    }

    fn report_failure(&self, err: &ListenerError) {
        match err {
            ListenerError::Authentication { status } => {
                self.status.stats.write().auth_failures += 1;
                error!(
                    status = *status,
                    username = %self.config.username,
                    "Camera rejected credentials, check camera.username and camera.password"
                );
            }
            other => warn!(error = %other, "Camera connection lost"),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let max = self.config.reconnect_max_delay();
        self.backoff.next_backoff().unwrap_or(max).min(max)
    }

    fn transition(&self, to: ConnectionState) {
        let mut state = self.status.state.write();
        let from = *state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Unexpected connection state transition");
        }
        *state = to;
        info!(from = %from, to = %to, "Connection state changed");
    }
}

fn check_status(response: Response) -> Result<Response, ListenerError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ListenerError::Authentication {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(ListenerError::TransientNetwork(format!(
            "camera answered HTTP {}",
            status
        )));
    }
    Ok(response)
}

/// Request target as it appears on the request line.
fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}
