//! Session event delivery
//!
//! The session never holds process-wide state for observers; whoever owns
//! the session passes a sink and receives callbacks from inside `dispatch`.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use transport::{Endpoint, TransportError};

/// Callbacks raised by the session during dispatch
///
/// All methods have empty default bodies so implementors pick only the
/// events they care about. Callbacks run on the dispatching task; keep
/// them short.
pub trait SessionEventSink: Send {
    /// A channel completed its handshake and entered ACTIVE
    fn on_channel_up(&mut self, _endpoint: &Endpoint) {}

    /// The current channel closed; `error` is `None` for a local close
    fn on_channel_down(&mut self, _endpoint: &Endpoint, _error: Option<&TransportError>) {}

    /// The file descriptor behind the session changed, e.g. after a
    /// migration swapped channels; pollers must re-register
    fn on_fd_change(&mut self, _endpoint: &Endpoint) {}

    /// A complete application payload arrived (reassembled if fragmented)
    fn on_message(&mut self, _payload: Bytes) {}

    /// A preferred-host fallback began connecting to `target`
    fn on_fallback_started(&mut self, _target: &Endpoint) {}

    /// A fallback finished; on success `endpoint` is the new current
    /// channel's endpoint, on failure the surviving one
    fn on_fallback_complete(&mut self, _endpoint: &Endpoint, _success: bool) {}
}

/// Sink that ignores every event
#[derive(Debug, Default)]
pub struct NullEventSink;

impl SessionEventSink for NullEventSink {}

/// One recorded session event, for test assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ChannelUp(String),
    ChannelDown(String),
    FdChange(String),
    FallbackStarted(String),
    FallbackComplete { endpoint: String, success: bool },
}

/// Sink that records events and payloads for later inspection
///
/// Clone one handle into the session and keep another for assertions.
/// Meant for tests; production sinks should react to events instead of
/// accumulating them.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
}

#[derive(Debug, Default)]
struct Recorded {
    events: Vec<SessionEvent>,
    messages: Vec<Bytes>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.lock().events.clone()
    }

    pub fn messages(&self) -> Vec<Bytes> {
        self.lock().messages.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SessionEventSink for RecordingSink {
    fn on_channel_up(&mut self, endpoint: &Endpoint) {
        self.lock()
            .events
            .push(SessionEvent::ChannelUp(endpoint.name.clone()));
    }

    fn on_channel_down(&mut self, endpoint: &Endpoint, _error: Option<&TransportError>) {
        self.lock()
            .events
            .push(SessionEvent::ChannelDown(endpoint.name.clone()));
    }

    fn on_fd_change(&mut self, endpoint: &Endpoint) {
        self.lock()
            .events
            .push(SessionEvent::FdChange(endpoint.name.clone()));
    }

    fn on_message(&mut self, payload: Bytes) {
        self.lock().messages.push(payload);
    }

    fn on_fallback_started(&mut self, target: &Endpoint) {
        self.lock()
            .events
            .push(SessionEvent::FallbackStarted(target.name.clone()));
    }

    fn on_fallback_complete(&mut self, endpoint: &Endpoint, success: bool) {
        self.lock().events.push(SessionEvent::FallbackComplete {
            endpoint: endpoint.name.clone(),
            success,
        });
    }
}
