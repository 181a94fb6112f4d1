//! FederationNode: the federation engine.
//!
//! [`FederationNode`] is the primary public API for intercom_federation. It
//! manages:
//! - the WebSocket listener (inbound links) and the dialer (outbound links)
//! - the handshake on every new link
//! - heartbeats and reconnects per peer
//! - per-peer mailboxes for messages sent while a peer is offline
//! - routing of inbound sync frames to the local subsystems
//!
//! Link tasks and timers never touch engine state themselves. They report
//! to a single event loop, which applies every change under one lock, so
//! state transitions for all peers are serialized.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::auth::{Credentials, SharedSecretCredentials, authenticate_peer};
use crate::config::{FederationConfig, PeerConfig};
use crate::connection::{Connections, Link, LinkPhase, TimerEvent, incoming_link_wins};
use crate::error::FederationError;
use crate::identity::{ServerId, ServerIdentity};
use crate::liveness;
use crate::mailbox::OutboundMailbox;
use crate::message::{AuthRequest, AuthResponse, AuthStatus, FederationMessage, now_millis};
use crate::peer::{ConnectionStatus, PeerRecord, PeerRegistry};
use crate::reconnect::{self, ReconnectPolicy};
use crate::router::{MessageRouter, Subsystems};
use crate::sync::{SyncAction, SyncFrame, SyncKind};
use crate::timer::TimerHandle;
use crate::transport::{self, Direction, LinkId, LinkSender, TransportEvent};

/// Format version stamped on exported configurations.
pub const EXPORT_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one delivery in a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub server_id: ServerId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot returned by [`FederationNode::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationStatus {
    pub server_id: ServerId,
    pub server_name: String,
    pub is_running: bool,
    pub total_peers: usize,
    pub connected_peers: usize,
    pub peers: Vec<PeerRecord>,
    pub queued_message_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationStats {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub disconnected_peers: usize,
    pub queued_message_count: usize,
    /// Seconds since `start()`; zero while stopped.
    pub uptime: u64,
}

/// The local identity plus the administrative part of every peer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationExport {
    pub server_id: ServerId,
    pub server_name: String,
    pub peers: Vec<PeerConfig>,
    pub exported_at: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub imported_count: usize,
    pub failed_count: usize,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// The federation engine.
///
/// Create one per server process. Call [`start()`](FederationNode::start) to
/// begin listening and dialing the configured peers, and
/// [`stop()`](FederationNode::stop) to tear every link down.
pub struct FederationNode {
    inner: Arc<Inner>,
    /// Shutdown signal for the listener and event loop.
    shutdown_tx: Option<broadcast::Sender<()>>,
    /// Bound listener address while running.
    local_addr: Option<SocketAddr>,
}

struct Inner {
    identity: ServerIdentity,
    config: FederationConfig,
    credentials: Arc<dyn Credentials>,
    router: MessageRouter,
    policy: ReconnectPolicy,
    state: Mutex<State>,
}

/// All mutable engine state. Only touched with the lock held, and the lock
/// is never held across an `.await`.
struct State {
    /// Senders into the event loop; `Some` exactly while running.
    channels: Option<Channels>,
    started_at: Option<Instant>,
    registry: PeerRegistry,
    connections: Connections,
    mailbox: OutboundMailbox,
}

#[derive(Clone)]
struct Channels {
    transport: mpsc::Sender<TransportEvent>,
    timers: mpsc::UnboundedSender<TimerEvent>,
    /// Runtime `start()` ran on. Dials are spawned here, since the public
    /// API may be called from threads outside any runtime.
    runtime: Handle,
}

impl FederationNode {
    /// Create an engine that authenticates peers with the configured shared
    /// secret.
    pub fn new(config: FederationConfig, subsystems: Subsystems) -> Self {
        let credentials = Arc::new(SharedSecretCredentials::new(
            &config.federation_secret,
            config.token_ttl,
        ));
        Self::with_credentials(config, subsystems, credentials)
    }

    /// Create an engine with a custom credential scheme.
    pub fn with_credentials(
        config: FederationConfig,
        subsystems: Subsystems,
        credentials: Arc<dyn Credentials>,
    ) -> Self {
        let identity = ServerIdentity::from_config(&config);
        let mut registry = PeerRegistry::new();
        register_configured(&mut registry, &identity.server_id, &config.peers);

        let state = State {
            channels: None,
            started_at: None,
            registry,
            connections: Connections::default(),
            mailbox: OutboundMailbox::new(config.mailbox_capacity),
        };

        Self {
            inner: Arc::new(Inner {
                policy: ReconnectPolicy::from_config(&config),
                identity,
                config,
                credentials,
                router: MessageRouter::new(subsystems),
                state: Mutex::new(state),
            }),
            shutdown_tx: None,
            local_addr: None,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.inner.identity
    }

    pub fn server_id(&self) -> &ServerId {
        &self.inner.identity.server_id
    }

    pub fn config(&self) -> &FederationConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener, start the event loop and dial every active peer.
    ///
    /// Returns the bound address, or `None` when federation is disabled in
    /// the configuration. Starting a running node is a no-op.
    pub async fn start(&mut self) -> Result<Option<SocketAddr>, FederationError> {
        if self.is_running() {
            return Ok(self.local_addr);
        }

        let inner = Arc::clone(&self.inner);
        if !inner.config.enabled {
            info!("Federation is disabled; not starting");
            return Ok(None);
        }
        inner.config.validate()?;

        let listener = transport::bind(inner.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(8);
        let (transport_tx, transport_rx) = mpsc::channel(256);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        tokio::spawn(transport::serve(
            listener,
            transport_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let loop_inner = Arc::clone(&inner);
        let loop_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop_inner
                .event_loop(transport_rx, timer_rx, loop_shutdown)
                .await;
        });

        {
            let mut state = inner.state.lock();
            state.channels = Some(Channels {
                transport: transport_tx,
                timers: timer_tx,
                runtime: Handle::current(),
            });
            state.started_at = Some(Instant::now());
            register_configured(&mut state.registry, &inner.identity.server_id, &inner.config.peers);

            let active: Vec<ServerId> = state
                .registry
                .iter()
                .filter(|p| p.is_active)
                .map(|p| p.server_id.clone())
                .collect();
            for peer_id in &active {
                inner.dial(&mut state, peer_id);
            }
        }

        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        info!(
            "Federation node '{}' started (server_id: {}, listening on {local_addr})",
            inner.identity.server_name, inner.identity.server_id
        );
        Ok(Some(local_addr))
    }

    /// Close every link and cancel every timer. Peers and queued messages
    /// are kept for a later `start()`.
    pub fn stop(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = tx.send(());
        self.local_addr = None;

        let mut state = self.inner.state.lock();
        state.channels = None;
        state.started_at = None;
        state.connections.clear();
        let ids: Vec<ServerId> = state.registry.iter().map(|p| p.server_id.clone()).collect();
        for id in &ids {
            state.registry.set_status(id, ConnectionStatus::Disconnected);
        }
        drop(state);

        info!("Federation node '{}' stopped", self.inner.identity.server_name);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self) -> FederationStatus {
        let state = self.inner.state.lock();
        FederationStatus {
            server_id: self.inner.identity.server_id.clone(),
            server_name: self.inner.identity.server_name.clone(),
            is_running: state.channels.is_some(),
            total_peers: state.registry.total_count(),
            connected_peers: state.registry.connected_count(),
            peers: state.registry.all(),
            queued_message_count: state.mailbox.total(),
        }
    }

    pub fn stats(&self) -> FederationStats {
        let state = self.inner.state.lock();
        let total = state.registry.total_count();
        let connected = state.registry.connected_count();
        FederationStats {
            total_peers: total,
            connected_peers: connected,
            disconnected_peers: total - connected,
            queued_message_count: state.mailbox.total(),
            uptime: state.started_at.map_or(0, |t| t.elapsed().as_secs()),
        }
    }

    pub fn peer_info(&self, server_id: &str) -> Option<PeerRecord> {
        self.inner
            .state
            .lock()
            .registry
            .get(&ServerId::from(server_id))
            .cloned()
    }

    /// Messages waiting in a peer's mailbox.
    pub fn queued_messages(&self, server_id: &str) -> usize {
        self.inner.state.lock().mailbox.len(&ServerId::from(server_id))
    }

    /// Consecutive failed outbound attempts for a peer.
    pub fn reconnect_attempts(&self, server_id: &str) -> u32 {
        self.inner
            .state
            .lock()
            .connections
            .slot(&ServerId::from(server_id))
            .map_or(0, |slot| slot.reconnect_attempts)
    }

    pub fn has_pending_reconnect(&self, server_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .connections
            .slot(&ServerId::from(server_id))
            .is_some_and(|slot| slot.reconnect.is_some())
    }

    pub fn export_config(&self) -> FederationExport {
        let state = self.inner.state.lock();
        FederationExport {
            server_id: self.inner.identity.server_id.clone(),
            server_name: self.inner.identity.server_name.clone(),
            peers: state.registry.iter().map(PeerRecord::to_config).collect(),
            exported_at: Utc::now(),
            version: EXPORT_VERSION.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Peer administration
    // -----------------------------------------------------------------------

    /// Register or update a peer and, if it is active, dial it. The reconnect
    /// counter starts over.
    pub fn add_peer(&self, peer: PeerConfig) -> bool {
        let inner = &*self.inner;
        if peer.server_id == inner.identity.server_id {
            warn!("Refusing to add the local server {} as a peer", peer.server_id);
            return false;
        }
        if let Err(e) = peer.validate() {
            warn!("Refusing to add peer: {e}");
            return false;
        }

        let id = peer.server_id.clone();
        let mut state = inner.state.lock();
        match state.registry.get_mut(&id) {
            Some(record) => {
                record.server_name = peer.server_name.clone();
                record.server_url = peer.server_url.clone();
                record.public_key = peer.public_key.clone();
                record.is_active = peer.is_active;
            }
            None => state.registry.upsert(PeerRecord::from_config(&peer)),
        }
        let slot = state.connections.slot_mut(&id);
        slot.reconnect_attempts = 0;
        slot.reconnect = None;
        info!("Added peer {id} at {}", peer.server_url);

        if peer.is_active {
            inner.dial(&mut state, &id);
        }
        true
    }

    /// Forget a peer: close its link, cancel its timers, drop its mailbox
    /// and delete its record.
    pub fn remove_peer(&self, server_id: &str) -> bool {
        let id = ServerId::from(server_id);
        let mut state = self.inner.state.lock();
        let existed = state.registry.remove(&id);
        let link = state.connections.remove_peer(&id);
        let dropped = state.mailbox.remove(&id);
        drop(state);

        if let Some(link) = link {
            debug!("Closing link {} to removed peer {id}", link.id);
        }
        if existed {
            info!("Removed peer {id} ({dropped} queued message(s) dropped)");
        }
        existed
    }

    /// Register every entry through [`add_peer`](Self::add_peer).
    pub fn import_peers(&self, peers: Vec<PeerConfig>) -> ImportSummary {
        let mut summary = ImportSummary {
            imported_count: 0,
            failed_count: 0,
        };
        for peer in peers {
            if self.add_peer(peer) {
                summary.imported_count += 1;
            } else {
                summary.failed_count += 1;
            }
        }
        info!(
            "Imported {} peer(s), {} failed",
            summary.imported_count, summary.failed_count
        );
        summary
    }

    /// Dial a registered peer now. No-op (returning true) when it already
    /// has a link.
    pub fn connect(&self, server_id: &str) -> bool {
        let id = ServerId::from(server_id);
        let mut state = self.inner.state.lock();
        self.inner.dial(&mut state, &id)
    }

    /// Close a peer's link and cancel any pending reconnect. The peer stays
    /// registered. Returns whether a link was open or being opened.
    pub fn disconnect(&self, server_id: &str) -> bool {
        let id = ServerId::from(server_id);
        let mut state = self.inner.state.lock();
        if !state.registry.contains(&id) {
            return false;
        }
        let slot = state.connections.slot_mut(&id);
        slot.reconnect = None;
        let Some(link_id) = slot.link else {
            return false;
        };
        let _ = state.connections.remove_link(link_id);
        state.registry.set_status(&id, ConnectionStatus::Disconnected);
        info!("Disconnected from peer {id} (link {link_id})");
        true
    }

    /// Administrative reconnect: drop the current link, if any, and dial
    /// again. Works after automatic retries have given up; the attempt
    /// counter is only reset once the link comes up.
    pub fn reconnect(&self, server_id: &str) -> bool {
        let id = ServerId::from(server_id);
        let mut state = self.inner.state.lock();
        if state.channels.is_none() || !state.registry.contains(&id) {
            return false;
        }
        let slot = state.connections.slot_mut(&id);
        slot.reconnect = None;
        if let Some(link_id) = slot.link {
            let _ = state.connections.remove_link(link_id);
        }
        info!("Manual reconnect to peer {id}");
        self.inner.dial(&mut state, &id)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send a message to one peer. Returns true if it was handed to an
    /// authenticated link; otherwise the message is queued in the peer's
    /// mailbox and flushed when the peer connects, and false is returned.
    /// Messages for unknown peers are dropped.
    pub fn send_to_peer(&self, server_id: &str, message: FederationMessage) -> bool {
        let id = ServerId::from(server_id);
        let mut state = self.inner.state.lock();
        if !state.registry.contains(&id) {
            warn!("Not sending {} to unknown peer {id}", message.wire_type());
            return false;
        }

        if let Some(sender) = state.connections.connected_sender(&id) {
            match sender.send(&message) {
                Ok(()) => {
                    debug!("Sent {} to {id}", message.wire_type());
                    return true;
                }
                Err(e) => warn!("Send to {id} failed, queueing: {e}"),
            }
        }

        debug!("Queued {} for {id}", message.wire_type());
        state.mailbox.enqueue(&id, message);
        false
    }

    /// Send a message to every connected peer. Peers that are not connected
    /// are skipped and nothing is queued for them.
    pub fn broadcast_to_peers(&self, message: &FederationMessage) -> Vec<DeliveryReport> {
        let state = self.inner.state.lock();
        state
            .registry
            .connected_ids()
            .into_iter()
            .map(|id| {
                let sent = state
                    .connections
                    .connected_sender(&id)
                    .ok_or_else(|| FederationError::Connection(format!("no open link to {id}")))
                    .and_then(|sender| sender.send(message));
                match sent {
                    Ok(()) => DeliveryReport {
                        server_id: id,
                        success: true,
                        error: None,
                    },
                    Err(e) => {
                        warn!("Broadcast of {} to {id} failed: {e}", message.wire_type());
                        DeliveryReport {
                            server_id: id,
                            success: false,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .collect()
    }

    /// Broadcast a sync frame originating from this server.
    pub fn sync(
        &self,
        kind: SyncKind,
        entity_id: &str,
        action: SyncAction,
        data: Value,
    ) -> Vec<DeliveryReport> {
        let frame = SyncFrame::new(kind, entity_id, action, data, self.server_id().clone());
        self.broadcast_to_peers(&FederationMessage::Sync(frame))
    }

    pub fn sync_group(&self, group_id: &str, action: SyncAction, data: Value) -> Vec<DeliveryReport> {
        self.sync(SyncKind::Group, group_id, action, data)
    }

    pub fn sync_user(&self, user_id: &str, action: SyncAction, data: Value) -> Vec<DeliveryReport> {
        self.sync(SyncKind::User, user_id, action, data)
    }

    pub fn sync_audio_route(
        &self,
        route_id: &str,
        action: SyncAction,
        data: Value,
    ) -> Vec<DeliveryReport> {
        self.sync(SyncKind::AudioRoute, route_id, action, data)
    }

    pub fn sync_recording(
        &self,
        recording_id: &str,
        action: SyncAction,
        data: Value,
    ) -> Vec<DeliveryReport> {
        self.sync(SyncKind::Recording, recording_id, action, data)
    }

    pub fn sync_matrix_room(
        &self,
        room_id: &str,
        action: SyncAction,
        data: Value,
    ) -> Vec<DeliveryReport> {
        self.sync(SyncKind::MatrixRoom, room_id, action, data)
    }
}

impl Drop for FederationNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Add configured peers that are not registered yet, skipping invalid ones.
fn register_configured(registry: &mut PeerRegistry, local: &ServerId, peers: &[PeerConfig]) {
    for peer in peers {
        if peer.server_id == *local {
            warn!("Ignoring configured peer {}: it is this server", peer.server_id);
            continue;
        }
        if let Err(e) = peer.validate() {
            warn!("Ignoring configured peer: {e}");
            continue;
        }
        if !registry.contains(&peer.server_id) {
            registry.upsert(PeerRecord::from_config(peer));
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

impl Inner {
    /// Apply transport and timer events one at a time until shutdown.
    async fn event_loop(
        self: Arc<Self>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(event) = transport_rx.recv() => {
                    if let Some(frame) = self.on_transport_event(event) {
                        self.router.dispatch(&frame).await;
                    }
                }

                Some(event) = timer_rx.recv() => {
                    self.on_timer_event(event);
                }

                _ = shutdown.recv() => {
                    debug!("Federation event loop shutting down");
                    break;
                }
            }
        }
    }

    /// Apply a transport event. Returns a sync frame to hand to the router
    /// once the lock is released.
    fn on_transport_event(&self, event: TransportEvent) -> Option<SyncFrame> {
        let mut state = self.state.lock();
        match event {
            TransportEvent::Opened {
                link_id,
                direction,
                remote,
                sender,
            } => {
                self.on_opened(&mut state, link_id, direction, remote, sender);
                None
            }
            TransportEvent::Frame { link_id, message } => self.on_frame(&mut state, link_id, message),
            TransportEvent::Malformed {
                link_id,
                frame_type,
                error,
            } => {
                let handshaking = state.connections.link(link_id).is_some_and(|link| {
                    link.direction == Direction::Inbound && link.phase == LinkPhase::Authenticating
                });
                if handshaking && frame_type.as_deref() == Some("auth") {
                    warn!("Rejected link {link_id}: {error}");
                    self.reject_link(&mut state, link_id, &error.to_string());
                } else {
                    warn!("Dropping malformed frame on link {link_id}: {error}");
                }
                None
            }
            TransportEvent::Closed { link_id, error } => {
                let status = match &error {
                    Some(e) => {
                        warn!("Link {link_id} failed: {e}");
                        ConnectionStatus::Error
                    }
                    None => {
                        debug!("Link {link_id} closed");
                        ConnectionStatus::Disconnected
                    }
                };
                self.fail_link(&mut state, link_id, status);
                None
            }
            TransportEvent::DialFailed { link_id, error } => {
                if let Some(peer_id) = state.connections.link(link_id).and_then(|l| l.server_id.as_ref()) {
                    warn!("Failed to connect to peer {peer_id}: {error}");
                }
                self.fail_link(&mut state, link_id, ConnectionStatus::Error);
                None
            }
        }
    }

    fn on_timer_event(&self, event: TimerEvent) {
        let mut state = self.state.lock();
        match event {
            TimerEvent::HandshakeExpired(link_id) => {
                let Some(link) = state.connections.link(link_id) else {
                    return;
                };
                if link.is_connected() {
                    return;
                }
                warn!(
                    "Link {link_id} with {} did not authenticate within {:?}; closing",
                    link.remote, self.config.handshake_timeout
                );
                self.fail_link(&mut state, link_id, ConnectionStatus::Error);
            }
            TimerEvent::ReconnectDue(peer_id) => {
                let Some(active) = state.registry.get(&peer_id).map(|p| p.is_active) else {
                    return;
                };
                state.connections.slot_mut(&peer_id).reconnect = None;
                if !active {
                    return;
                }
                if let Some(link) = state.connections.bound_link(&peer_id) {
                    debug!("Reconnect to {peer_id} skipped: link {} already open", link.id);
                    return;
                }
                self.dial(&mut state, &peer_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Link lifecycle
    // -----------------------------------------------------------------------

    /// Start dialing a registered peer unless it already has a link.
    fn dial(&self, state: &mut State, peer_id: &ServerId) -> bool {
        let Some((events, runtime)) = state
            .channels
            .as_ref()
            .map(|c| (c.transport.clone(), c.runtime.clone()))
        else {
            return false;
        };
        let Some(url) = state.registry.get(peer_id).map(|p| p.server_url.clone()) else {
            return false;
        };
        if url.is_empty() {
            debug!("Peer {peer_id} has no known URL; not dialing");
            return false;
        }
        if let Some(link) = state.connections.bound_link(peer_id) {
            debug!("Peer {peer_id} already has link {}", link.id);
            return true;
        }

        let link_id = transport::next_link_id();
        state
            .connections
            .insert_link(Link::dialing(link_id, peer_id.clone(), url.clone()));
        state.connections.bind(peer_id, link_id);
        state.connections.slot_mut(peer_id).reconnect = None;
        state.registry.set_status(peer_id, ConnectionStatus::Connecting);
        info!("Connecting to peer {peer_id} at {url} (link {link_id})");

        runtime.spawn(transport::dial(
            link_id,
            url,
            self.config.connect_timeout,
            events,
        ));
        true
    }

    fn on_opened(
        &self,
        state: &mut State,
        link_id: LinkId,
        direction: Direction,
        remote: String,
        sender: LinkSender,
    ) {
        if state.channels.is_none() {
            sender.close();
            return;
        }
        let handshake_timer = self.handshake_timer(state, link_id);

        match direction {
            Direction::Outbound => {
                let Some(link) = state.connections.link_mut(link_id) else {
                    debug!("Link {link_id} to {remote} is no longer wanted; closing");
                    sender.close();
                    return;
                };
                link.sender = Some(sender.clone());
                link.phase = LinkPhase::Authenticating;
                link.handshake_timer = handshake_timer;
                let Some(peer_id) = link.server_id.clone() else {
                    return;
                };
                state
                    .registry
                    .set_status(&peer_id, ConnectionStatus::Authenticating);

                let request = match self.auth_request() {
                    Ok(request) => request,
                    Err(e) => {
                        error!("Cannot issue a handshake token for {peer_id}: {e}");
                        self.fail_link(state, link_id, ConnectionStatus::Error);
                        return;
                    }
                };
                match sender.send(&FederationMessage::Auth(request)) {
                    Ok(()) => debug!("Link {link_id}: sent auth to {peer_id}"),
                    Err(e) => debug!("Link {link_id}: auth not sent: {e}"),
                }
            }
            Direction::Inbound => {
                let open = state.connections.live_count();
                if open >= self.config.max_connections {
                    warn!("Refusing link from {remote}: {open} links already open");
                    sender.close();
                    return;
                }
                debug!("Link {link_id}: accepted {remote}, awaiting auth");
                let mut link = Link::accepted(link_id, remote, sender);
                link.handshake_timer = handshake_timer;
                state.connections.insert_link(link);
            }
        }
    }

    fn handshake_timer(&self, state: &State, link_id: LinkId) -> Option<TimerHandle> {
        let timers = state.channels.as_ref()?.timers.clone();
        let timeout = self.config.handshake_timeout;
        Some(TimerHandle::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timers.send(TimerEvent::HandshakeExpired(link_id));
        }))
    }

    fn auth_request(&self) -> Result<AuthRequest, FederationError> {
        Ok(AuthRequest {
            server_id: self.identity.server_id.clone(),
            server_name: self.identity.server_name.clone(),
            auth_token: self.credentials.issue(&self.identity)?,
            server_url: Some(self.identity.server_url.clone()),
            public_key: self.identity.public_key.clone(),
            capabilities: self.identity.capabilities.clone(),
            timestamp: now_millis(),
        })
    }

    fn on_frame(
        &self,
        state: &mut State,
        link_id: LinkId,
        message: FederationMessage,
    ) -> Option<SyncFrame> {
        let Some(link) = state.connections.link(link_id) else {
            debug!("Dropping {} on closed link {link_id}", message.wire_type());
            return None;
        };
        let (direction, phase) = (link.direction, link.phase);
        let peer_id = link.server_id.clone();

        match message {
            FederationMessage::Auth(request) => {
                if direction == Direction::Inbound && phase == LinkPhase::Authenticating {
                    self.on_auth(state, link_id, request);
                } else {
                    warn!("Unexpected auth on link {link_id}; dropped");
                }
                None
            }
            FederationMessage::AuthResponse(response) => {
                if direction == Direction::Outbound && phase == LinkPhase::Authenticating {
                    self.on_auth_response(state, link_id, response);
                } else {
                    warn!("Unexpected auth_response on link {link_id}; dropped");
                }
                None
            }
            message => {
                let (LinkPhase::Connected, Some(peer_id)) = (phase, peer_id) else {
                    warn!(
                        "Dropping {} on unauthenticated link {link_id}",
                        message.wire_type()
                    );
                    return None;
                };
                self.on_peer_frame(state, link_id, &peer_id, message)
            }
        }
    }

    /// A frame on an authenticated link.
    fn on_peer_frame(
        &self,
        state: &mut State,
        link_id: LinkId,
        peer_id: &ServerId,
        message: FederationMessage,
    ) -> Option<SyncFrame> {
        match message {
            FederationMessage::Heartbeat(_) => {
                state.registry.touch(peer_id);
                let reply = liveness::heartbeat_reply(&self.identity.server_id);
                if let Some(sender) = state.connections.link(link_id).and_then(|l| l.sender.as_ref()) {
                    if let Err(e) = sender.send(&reply) {
                        debug!("Heartbeat reply to {peer_id} not sent: {e}");
                    }
                }
                None
            }
            FederationMessage::HeartbeatResponse(_) => {
                state.registry.touch(peer_id);
                None
            }
            FederationMessage::Sync(frame) => {
                if frame.server_id != *peer_id {
                    warn!(
                        "Dropping {} claiming origin {} on link {link_id} authenticated as {peer_id}",
                        frame.kind, frame.server_id
                    );
                    return None;
                }
                debug!(
                    "Received {} {} {} from {peer_id}",
                    frame.kind, frame.action, frame.entity_id
                );
                Some(frame)
            }
            FederationMessage::Auth(_) | FederationMessage::AuthResponse(_) => None,
        }
    }

    /// Acceptor side of the handshake.
    fn on_auth(&self, state: &mut State, link_id: LinkId, request: AuthRequest) {
        let claims = match authenticate_peer(
            self.credentials.as_ref(),
            &self.identity.server_id,
            &request.auth_token,
        ) {
            Ok(claims) => claims,
            Err(e) => {
                warn!("Rejected link {link_id} claiming {}: {e}", request.server_id);
                self.reject_link(state, link_id, &e.to_string());
                return;
            }
        };
        let peer_id = claims.server_id;
        if request.server_id != peer_id {
            warn!(
                "Link {link_id}: auth frame names {} but its token names {peer_id}; trusting the token",
                request.server_id
            );
        }

        let existing = state
            .connections
            .bound_link(&peer_id)
            .map(|link| (link.id, link.direction));
        if let Some((existing_id, existing_direction)) = existing {
            if incoming_link_wins(&self.identity.server_id, &peer_id, existing_direction) {
                info!("Link {link_id} from {peer_id} replaces link {existing_id}");
                let _ = state.connections.remove_link(existing_id);
            } else {
                info!("Refusing duplicate link {link_id} from {peer_id}; keeping link {existing_id}");
                self.reject_link(state, link_id, "duplicate link");
                return;
            }
        }

        match state.registry.get_mut(&peer_id) {
            Some(record) => {
                if !request.server_name.is_empty() {
                    record.server_name = request.server_name.clone();
                }
                if record.server_url.is_empty() {
                    record.server_url = request.server_url.clone().unwrap_or_default();
                }
                if request.public_key.is_some() {
                    record.public_key = request.public_key.clone();
                }
                record.capabilities = request.capabilities.clone();
            }
            None => {
                info!("Registering peer {peer_id} from its inbound handshake");
                let server_url = request.server_url.clone().unwrap_or_default();
                // Without a URL we cannot dial back; the peer stays passive.
                let is_active = !server_url.is_empty();
                let mut record = PeerRecord::from_config(&PeerConfig {
                    server_id: peer_id.clone(),
                    server_name: request.server_name.clone(),
                    server_url,
                    public_key: request.public_key.clone(),
                    is_active,
                });
                record.capabilities = request.capabilities.clone();
                state.registry.upsert(record);
            }
        }

        state.connections.bind(&peer_id, link_id);
        let accepted = FederationMessage::AuthResponse(AuthResponse::authenticated(&self.identity));
        if let Some(sender) = state.connections.link(link_id).and_then(|l| l.sender.as_ref()) {
            if let Err(e) = sender.send(&accepted) {
                debug!("Link {link_id}: auth_response not sent: {e}");
            }
        }
        self.mark_connected(state, link_id, &peer_id);
    }

    /// Dialer side of the handshake.
    fn on_auth_response(&self, state: &mut State, link_id: LinkId, response: AuthResponse) {
        let Some(peer_id) = state.connections.link(link_id).and_then(|l| l.server_id.clone()) else {
            return;
        };
        match response.status {
            AuthStatus::Authenticated
                if !response.server_id.is_empty() && response.server_id != peer_id =>
            {
                warn!(
                    "Link {link_id}: dialed {peer_id} but {} answered; closing",
                    response.server_id
                );
                self.fail_link(state, link_id, ConnectionStatus::Error);
            }
            AuthStatus::Authenticated => {
                if let (Some(record), Some(capabilities)) =
                    (state.registry.get_mut(&peer_id), response.capabilities)
                {
                    record.capabilities = capabilities;
                }
                self.mark_connected(state, link_id, &peer_id);
            }
            AuthStatus::Failed => {
                warn!(
                    "Peer {peer_id} rejected our handshake: {}",
                    response.error.as_deref().unwrap_or("no reason given")
                );
                self.fail_link(state, link_id, ConnectionStatus::Error);
            }
        }
    }

    /// Handshake complete: start heartbeats, reset the retry counter and
    /// flush the mailbox.
    fn mark_connected(&self, state: &mut State, link_id: LinkId, peer_id: &ServerId) {
        let Some(link) = state.connections.link_mut(link_id) else {
            return;
        };
        link.phase = LinkPhase::Connected;
        link.handshake_timer = None;
        link.heartbeat = link.sender.clone().map(|sender| {
            liveness::start_heartbeat(
                sender,
                self.identity.server_id.clone(),
                self.config.heartbeat_interval,
            )
        });
        let direction = link.direction;

        let slot = state.connections.slot_mut(peer_id);
        slot.reconnect_attempts = 0;
        slot.reconnect = None;
        state.registry.set_status(peer_id, ConnectionStatus::Connected);
        state.registry.touch(peer_id);
        info!("Peer {peer_id} connected ({direction:?} link {link_id})");

        self.flush(state, peer_id);
    }

    /// Deliver a peer's queued messages in order. Whatever cannot be sent is
    /// put back at the head of the queue.
    fn flush(&self, state: &mut State, peer_id: &ServerId) {
        let Some(sender) = state.connections.connected_sender(peer_id).cloned() else {
            return;
        };
        let queued = state.mailbox.take(peer_id);
        if queued.is_empty() {
            return;
        }

        let total = queued.len();
        let mut pending = queued.into_iter();
        let mut sent = 0;
        while let Some(message) = pending.next() {
            if let Err(e) = sender.send(&message) {
                warn!("Flush to {peer_id} stopped after {sent}/{total} message(s): {e}");
                let rest = std::iter::once(message).chain(pending).collect();
                state.mailbox.restore(peer_id, rest);
                return;
            }
            sent += 1;
        }
        info!("Delivered {sent} queued message(s) to {peer_id}");
    }

    /// Answer an inbound handshake with a failure and close the link.
    fn reject_link(&self, state: &mut State, link_id: LinkId, reason: &str) {
        let Some((link, _)) = state.connections.remove_link(link_id) else {
            return;
        };
        if let Some(sender) = &link.sender {
            let rejected = FederationMessage::AuthResponse(AuthResponse::failed(&self.identity, reason));
            if let Err(e) = sender.send(&rejected) {
                debug!("Link {link_id}: rejection not sent: {e}");
            }
        }
    }

    /// Tear a link down after it failed or closed. If it was its peer's
    /// link, the peer takes `status`, and an active peer we dialed gets a
    /// reconnect scheduled.
    fn fail_link(&self, state: &mut State, link_id: LinkId, status: ConnectionStatus) {
        let Some((link, was_bound)) = state.connections.remove_link(link_id) else {
            return;
        };
        let Some(peer_id) = link.server_id.clone().filter(|_| was_bound) else {
            return;
        };
        state.registry.set_status(&peer_id, status);
        info!("Link {link_id} to {peer_id} is down");

        let redial = link.direction == Direction::Outbound
            && state.registry.get(&peer_id).is_some_and(|p| p.is_active);
        drop(link);
        if redial {
            self.schedule_reconnect(state, &peer_id);
        }
    }

    fn schedule_reconnect(&self, state: &mut State, peer_id: &ServerId) {
        let Some(timers) = state.channels.as_ref().map(|c| c.timers.clone()) else {
            return;
        };
        let policy = self.policy;
        let slot = state.connections.slot_mut(peer_id);
        match policy.next_attempt(&mut slot.reconnect_attempts) {
            Some(delay) => {
                info!(
                    "Reconnecting to {peer_id} in {delay:?} (attempt {}/{})",
                    slot.reconnect_attempts, policy.max_attempts
                );
                slot.reconnect = Some(reconnect::schedule(peer_id.clone(), delay, timers));
            }
            None => {
                slot.reconnect = None;
                warn!(
                    "Giving up on {peer_id} after {} reconnect attempts",
                    slot.reconnect_attempts
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
