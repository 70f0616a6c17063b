//! Hand-off of classified events to the persistence collaborator.
//!
//! Delivery is fire-and-forget: a sink must return quickly and never stall
//! the listener. A sink that cannot accept an event reports it and the
//! listener moves on.

use crate::classifier::{DomainEvent, EventKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Errors a sink can report for a single event.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink queue full, event dropped")]
    Backpressure,

    #[error("Sink unavailable")]
    Unavailable,
}

/// Receiver of classified events.
pub trait EventSink: Send + Sync {
    /// Accept one event without blocking.
    fn on_event(&self, event: DomainEvent) -> Result<(), SinkError>;
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn on_event(&self, event: DomainEvent) -> Result<(), SinkError> {
        (**self).on_event(event)
    }
}

/// Sink backed by a bounded channel drained by a recorder task.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<DomainEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its recorder reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: DomainEvent) -> Result<(), SinkError> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SinkError::Unavailable,
        })
    }
}

/// Drops intrusions that follow the previously accepted one too closely.
///
/// A person lingering in a zone makes the camera fire repeatedly; only the
/// first alarm of a burst is of interest.
pub struct IntrusionDebounce<S> {
    inner: S,
    window: chrono::Duration,
    last_accepted: Mutex<Option<DateTime<Utc>>>,
}

impl<S: EventSink> IntrusionDebounce<S> {
    pub fn new(inner: S, window: Duration) -> Self {
        Self {
            inner,
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()),
            last_accepted: Mutex::new(None),
        }
    }
}

impl<S: EventSink> EventSink for IntrusionDebounce<S> {
    fn on_event(&self, event: DomainEvent) -> Result<(), SinkError> {
        if event.kind == EventKind::Intrusion && self.window > chrono::Duration::zero() {
            let mut last = self.last_accepted.lock();
            if let Some(prev) = *last {
                if event.timestamp - prev < self.window {
                    debug!(
                        rule = %event.rule_name,
                        since_last_ms = (event.timestamp - prev).num_milliseconds(),
                        "Debounced intrusion event"
                    );
                    return Ok(());
                }
            }
            // Only an intrusion the inner sink took opens a new window.
            let timestamp = event.timestamp;
            self.inner.on_event(event)?;
            *last = Some(timestamp);
            return Ok(());
        }
        self.inner.on_event(event)
    }
}

/// Sink that keeps every event in memory; used by tests and tools.
#[derive(Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn on_event(&self, event: DomainEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}
