//! Scoped events: everything N parallel connections produce, funneled into
//! one sequential stream keyed by endpoint id. The event loop is the only
//! consumer, which is what makes cross-endpoint state application race-free
//! without locking the app state.

use concord_protocol::{ErrorPayload, Event};
use uuid::Uuid;

/// Client-generated, stable across restarts; the remote server never
/// learns it.
pub type EndpointId = Uuid;

/// Connection lifecycle, as observed by the supervisor and the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    /// Transport up, Identify not yet accepted.
    Connected,
    Authenticating,
    Ready,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Terminal for this endpoint until the user intervenes.
    Error(String),
}

impl ConnState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnState::Ready)
    }
}

/// One thing a connection has to tell the application.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    StateChanged(ConnState),
    /// A server dispatch with its sequence number.
    Dispatch { seq: u64, event: Event },
    /// The server rejected our session; the supervisor re-runs auth.
    InvalidSession { reason: String },
    /// The server asked us to drop and redial.
    Reconnect,
    /// A protocol error addressed to us.
    ProtocolError(ErrorPayload),
    /// The transport is gone.
    Closed,
}

/// An inbound event tagged with the endpoint that produced it.
#[derive(Debug, Clone)]
pub struct ServerScopedMsg {
    pub endpoint_id: EndpointId,
    pub inner: ConnEvent,
}
