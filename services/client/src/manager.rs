//! The multi-server connection manager.
//!
//! One supervised `ServerConnection` per endpoint, all funneling into a
//! single scoped event channel. Each endpoint runs the three-step
//! auto-connect flow (saved token → HTTP login → HTTP register) as one
//! sequential task, reconnecting on failure under the backoff policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use concord_protocol::{
    Frame, OpCode, PresenceUpdateCommand, RequestGuildCommand, RequestMessagesCommand,
    SendMessageCommand, Status, TypingStartCommand, WhisperCommand,
};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::api::AuthApi;
use crate::backoff::ReconnectPolicy;
use crate::connection::{ConnectError, ServerConnection};
use crate::events::{ConnEvent, ConnState, EndpointId, ServerScopedMsg};
use crate::storage::{ClientServerInfo, Identity};

/// How long the handshake may take from Identify to READY.
const READY_DEADLINE: Duration = Duration::from_secs(15);
/// Idle presence kicks in after this much inactivity.
const IDLE_AFTER: Duration = Duration::from_secs(600);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct Endpoint {
    info: ClientServerInfo,
    active: Mutex<Option<Arc<ServerConnection>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

pub struct ConnectionManager {
    endpoints: RwLock<HashMap<EndpointId, Arc<Endpoint>>>,
    event_tx: mpsc::Sender<ServerScopedMsg>,
    policy: ReconnectPolicy,
    identity: Option<Identity>,
    activity_tx: watch::Sender<Instant>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Returns the manager and the receiving half of the scoped event
    /// channel, which the event loop consumes.
    pub fn new(
        identity: Option<Identity>,
        policy: ReconnectPolicy,
    ) -> (Arc<Self>, mpsc::Receiver<ServerScopedMsg>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (activity_tx, _) = watch::channel(Instant::now());
        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            event_tx,
            policy,
            identity,
            activity_tx,
            shutdown_tx,
        });
        manager.clone().spawn_idle_timer();
        (manager, event_rx)
    }

    /// Register an endpoint and start supervising it. Endpoints connect
    /// concurrently with each other; the flow within one endpoint is
    /// strictly sequential.
    pub async fn add_endpoint(self: &Arc<Self>, info: ClientServerInfo) {
        let endpoint_id = info.id;
        let endpoint = Arc::new(Endpoint {
            info,
            active: Mutex::new(None),
            supervisor: Mutex::new(None),
        });
        self.endpoints
            .write()
            .await
            .insert(endpoint_id, Arc::clone(&endpoint));

        let manager = Arc::clone(self);
        let handle = tokio::spawn({
            let endpoint = Arc::clone(&endpoint);
            async move { manager.supervise(endpoint).await }
        });
        *endpoint.supervisor.lock().await = Some(handle);
    }

    /// The endpoint's live connection, if it has one.
    pub async fn connection(&self, endpoint_id: EndpointId) -> Option<Arc<ServerConnection>> {
        let endpoints = self.endpoints.read().await;
        let endpoint = endpoints.get(&endpoint_id)?;
        endpoint.active.lock().await.clone()
    }

    /// Record user activity; flips presence back to Online if the idle
    /// timer had demoted it.
    pub fn note_activity(&self) {
        self.activity_tx.send_replace(Instant::now());
    }

    /// Close every endpoint and stop supervising. Queues close exactly
    /// once; the scoped channel drains whatever is already in flight.
    pub async fn close(&self) {
        self.shutdown_tx.send_replace(true);
        let endpoints = self.endpoints.read().await;
        for endpoint in endpoints.values() {
            if let Some(handle) = endpoint.supervisor.lock().await.take() {
                handle.abort();
            }
            if let Some(conn) = endpoint.active.lock().await.take() {
                conn.disconnect();
            }
        }
    }

    // -- outbound actions ----------------------------------------------------

    pub async fn send_message(
        &self,
        endpoint_id: EndpointId,
        cmd: SendMessageCommand,
    ) -> bool {
        self.note_activity();
        self.send_command(endpoint_id, OpCode::SendMessage, &cmd).await
    }

    pub async fn start_typing(&self, endpoint_id: EndpointId, cmd: TypingStartCommand) -> bool {
        self.note_activity();
        self.send_command(endpoint_id, OpCode::TypingStart, &cmd).await
    }

    pub async fn request_messages(
        &self,
        endpoint_id: EndpointId,
        cmd: RequestMessagesCommand,
    ) -> bool {
        self.send_command(endpoint_id, OpCode::RequestMessages, &cmd).await
    }

    pub async fn request_guild(&self, endpoint_id: EndpointId, cmd: RequestGuildCommand) -> bool {
        self.send_command(endpoint_id, OpCode::RequestGuild, &cmd).await
    }

    pub async fn whisper(&self, endpoint_id: EndpointId, cmd: WhisperCommand) -> bool {
        self.note_activity();
        self.send_command(endpoint_id, OpCode::Whisper, &cmd).await
    }

    pub async fn set_presence(&self, status: Status, status_text: &str) {
        let cmd = PresenceUpdateCommand { status, status_text: status_text.to_owned() };
        let endpoints = self.endpoints.read().await;
        for endpoint in endpoints.values() {
            if let Some(conn) = endpoint.active.lock().await.clone() {
                if conn.state().is_ready() {
                    if let Ok(frame) = Frame::with_payload(OpCode::PresenceUpdate, &cmd) {
                        conn.send(frame);
                    }
                }
            }
        }
    }

    async fn send_command<T: serde::Serialize>(
        &self,
        endpoint_id: EndpointId,
        op: OpCode,
        payload: &T,
    ) -> bool {
        let Some(conn) = self.connection(endpoint_id).await else {
            return false;
        };
        match Frame::with_payload(op, payload) {
            Ok(frame) => {
                conn.send(frame);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to encode command");
                false
            }
        }
    }

    // -- supervision ---------------------------------------------------------

    async fn supervise(self: Arc<Self>, endpoint: Arc<Endpoint>) {
        let endpoint_id = endpoint.info.id;
        let mut attempt: u32 = 0;
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.connect_endpoint(&endpoint).await {
                Ok(conn) => {
                    attempt = 0;
                    info!(endpoint_id = %endpoint_id, "endpoint ready");
                    // Park until this connection dies.
                    let mut state_rx = conn.watch_state();
                    loop {
                        let state = state_rx.borrow_and_update().clone();
                        if matches!(state, ConnState::Disconnected | ConnState::Error(_)) {
                            break;
                        }
                        tokio::select! {
                            changed = state_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    conn.disconnect();
                                    return;
                                }
                            }
                        }
                    }
                    endpoint.active.lock().await.take();
                }
                Err(e) => {
                    warn!(endpoint_id = %endpoint_id, error = %e, "connect attempt failed");
                }
            }

            attempt += 1;
            let Some(delay) = self.policy.next_delay(attempt) else {
                self.emit(
                    endpoint_id,
                    ConnEvent::StateChanged(ConnState::Error(format!(
                        "gave up after {} attempts",
                        self.policy.max_attempts
                    ))),
                )
                .await;
                return;
            };
            self.emit(
                endpoint_id,
                ConnEvent::StateChanged(ConnState::Reconnecting),
            )
            .await;
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// The three-step auth flow, strictly sequential:
    /// 1. saved token, 2. HTTP login, 3. HTTP register.
    async fn connect_endpoint(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<ServerConnection>, ConnectError> {
        let info = &endpoint.info;
        let api = AuthApi::new(info.http_base());

        // Step 1: a saved token, if we have one.
        let saved_token = info
            .saved_credentials
            .as_ref()
            .and_then(|c| c.token.clone());
        if let Some(token) = saved_token {
            match self.dial_and_identify(endpoint, &token).await {
                Ok(conn) => return Ok(conn),
                Err(ConnectError::InvalidSession(reason)) => {
                    info!(endpoint_id = %info.id, reason = %reason, "saved token rejected, re-authenticating");
                }
                Err(other) => return Err(other),
            }
        }

        // Steps 2 and 3 need credentials to work with.
        let (email, password, alias) = self
            .credentials_for(info)
            .ok_or_else(|| ConnectError::Auth("no credentials available".to_owned()))?;

        // Step 2: login.
        match api.login(&email, &password).await {
            Ok(auth) => return self.dial_and_identify(endpoint, &auth.token).await,
            Err(e) if e.is_rejection() => {
                info!(endpoint_id = %info.id, "login rejected, trying registration");
            }
            Err(e) => {
                warn!(endpoint_id = %info.id, error = %e, "login request failed");
                return Err(ConnectError::Auth(e.to_string()));
            }
        }

        // Step 3: register.
        match api.register(&alias, &email, &password).await {
            Ok(auth) => self.dial_and_identify(endpoint, &auth.token).await,
            Err(e) => {
                warn!(endpoint_id = %info.id, error = %e, "registration failed");
                Err(ConnectError::Auth(e.to_string()))
            }
        }
    }

    fn credentials_for(&self, info: &ClientServerInfo) -> Option<(String, String, String)> {
        let identity = self.identity.as_ref()?;
        let email = info
            .saved_credentials
            .as_ref()
            .map_or_else(|| identity.email.clone(), |c| c.email.clone());
        Some((email, identity.password.clone(), identity.alias.clone()))
    }

    async fn dial_and_identify(
        &self,
        endpoint: &Endpoint,
        token: &str,
    ) -> Result<Arc<ServerConnection>, ConnectError> {
        let conn =
            ServerConnection::connect(endpoint.info.id, &endpoint.info.ws_url(), self.event_tx.clone())
                .await?;
        // Publish the connection before Identify goes out: READY can arrive
        // on the read task before `identify` returns, and whoever handles it
        // must already find this connection as the active one.
        *endpoint.active.lock().await = Some(Arc::clone(&conn));
        conn.identify(token).await?;
        match conn.wait_ready(READY_DEADLINE).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.disconnect();
                endpoint.active.lock().await.take();
                Err(e)
            }
        }
    }

    async fn emit(&self, endpoint_id: EndpointId, inner: ConnEvent) {
        let _ = self
            .event_tx
            .send(ServerScopedMsg { endpoint_id, inner })
            .await;
    }

    /// Demote presence to Idle after 10 minutes without recorded activity;
    /// promote back to Online on the next activity.
    fn spawn_idle_timer(self: Arc<Self>) {
        let mut activity_rx = self.activity_tx.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut idle = false;
            loop {
                let last = *activity_rx.borrow_and_update();
                let deadline = last + IDLE_AFTER;
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    changed = activity_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if idle {
                            idle = false;
                            self.set_presence(Status::Online, "").await;
                        }
                    }
                    () = tokio::time::sleep_until(deadline), if !idle => {
                        idle = true;
                        self.set_presence(Status::Idle, "").await;
                    }
                }
            }
        });
    }
}
