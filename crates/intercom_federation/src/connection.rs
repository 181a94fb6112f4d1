//! Link and per-peer state owned by the connection manager.
//!
//! A [`Link`] is one physical connection, from the moment we start dialing
//! (or accept a socket) until it is torn down. A [`PeerSlot`] is the runtime
//! side of a registry entry: the one link currently bound to the peer and
//! the reconnect bookkeeping. Dropping either cancels the timers it owns.

use std::collections::HashMap;

use crate::identity::ServerId;
use crate::timer::TimerHandle;
use crate::transport::{Direction, LinkId, LinkSender};

/// Timer expirations fed back into the node's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The link did not finish its handshake in time.
    HandshakeExpired(LinkId),
    /// A scheduled reconnect for this peer is due.
    ReconnectDue(ServerId),
}

/// Where a link is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Outbound dial in progress; no socket yet.
    Dialing,
    /// Socket open, waiting for `auth` (inbound) or `auth_response` (outbound).
    Authenticating,
    /// Handshake complete.
    Connected,
}

#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub direction: Direction,
    /// Known from the start for outbound links, after `auth` for inbound ones.
    pub server_id: Option<ServerId>,
    pub phase: LinkPhase,
    /// Remote address or dialed URL, for logs.
    pub remote: String,
    pub sender: Option<LinkSender>,
    pub heartbeat: Option<TimerHandle>,
    pub handshake_timer: Option<TimerHandle>,
}

impl Link {
    pub fn dialing(id: LinkId, server_id: ServerId, url: String) -> Self {
        Self {
            id,
            direction: Direction::Outbound,
            server_id: Some(server_id),
            phase: LinkPhase::Dialing,
            remote: url,
            sender: None,
            heartbeat: None,
            handshake_timer: None,
        }
    }

    pub fn accepted(id: LinkId, remote: String, sender: LinkSender) -> Self {
        Self {
            id,
            direction: Direction::Inbound,
            server_id: None,
            phase: LinkPhase::Authenticating,
            remote,
            sender: Some(sender),
            heartbeat: None,
            handshake_timer: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == LinkPhase::Connected
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(sender) = &self.sender {
            sender.close();
        }
    }
}

/// Runtime state attached to a registered peer.
#[derive(Debug, Default)]
pub struct PeerSlot {
    /// The single link bound to this peer, in any phase.
    pub link: Option<LinkId>,
    /// Consecutive failed outbound attempts since the last successful one.
    pub reconnect_attempts: u32,
    /// Pending reconnect timer, if one is scheduled.
    pub reconnect: Option<TimerHandle>,
}

/// Every live link plus the per-peer slots.
#[derive(Debug, Default)]
pub struct Connections {
    links: HashMap<LinkId, Link>,
    slots: HashMap<ServerId, PeerSlot>,
}

impl Connections {
    pub fn link(&self, link_id: LinkId) -> Option<&Link> {
        self.links.get(&link_id)
    }

    pub fn link_mut(&mut self, link_id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&link_id)
    }

    pub fn insert_link(&mut self, link: Link) {
        self.links.insert(link.id, link);
    }

    /// Number of links in any phase.
    pub fn live_count(&self) -> usize {
        self.links.len()
    }

    pub fn slot(&self, server_id: &ServerId) -> Option<&PeerSlot> {
        self.slots.get(server_id)
    }

    pub fn slot_mut(&mut self, server_id: &ServerId) -> &mut PeerSlot {
        self.slots.entry(server_id.clone()).or_default()
    }

    /// The link bound to a peer, in any phase.
    pub fn bound_link(&self, server_id: &ServerId) -> Option<&Link> {
        self.slots
            .get(server_id)
            .and_then(|slot| slot.link)
            .and_then(|id| self.links.get(&id))
    }

    /// Write handle of the peer's link if it has completed the handshake.
    pub fn connected_sender(&self, server_id: &ServerId) -> Option<&LinkSender> {
        self.bound_link(server_id)
            .filter(|link| link.is_connected())
            .and_then(|link| link.sender.as_ref())
    }

    /// Bind a link to a peer.
    pub fn bind(&mut self, server_id: &ServerId, link_id: LinkId) {
        if let Some(link) = self.links.get_mut(&link_id) {
            link.server_id = Some(server_id.clone());
        }
        self.slot_mut(server_id).link = Some(link_id);
    }

    /// Remove a link. The flag tells whether it was the one bound to its
    /// peer; if so the peer is left without a link.
    pub fn remove_link(&mut self, link_id: LinkId) -> Option<(Link, bool)> {
        let link = self.links.remove(&link_id)?;
        let was_bound = match link.server_id.as_ref().and_then(|id| self.slots.get_mut(id)) {
            Some(slot) if slot.link == Some(link_id) => {
                slot.link = None;
                true
            }
            _ => false,
        };
        Some((link, was_bound))
    }

    /// Forget a peer: its slot, reconnect timer and bound link.
    pub fn remove_peer(&mut self, server_id: &ServerId) -> Option<Link> {
        let slot = self.slots.remove(server_id)?;
        slot.link.and_then(|id| self.links.remove(&id))
    }

    /// Tear down every link and pending timer, keeping attempt counters.
    pub fn clear(&mut self) {
        self.links.clear();
        for slot in self.slots.values_mut() {
            slot.link = None;
            slot.reconnect = None;
        }
    }
}

/// When a second link to the same peer authenticates, decide whether the
/// newly authenticated inbound link replaces the existing one.
///
/// Between an inbound and an outbound link, the link dialed by the server
/// with the smaller id survives; both ends reach the same verdict. Between
/// two inbound links the newer one survives, since the remote side only
/// redials when it considers the old link dead.
pub fn incoming_link_wins(local: &ServerId, remote: &ServerId, existing: Direction) -> bool {
    match existing {
        Direction::Inbound => true,
        Direction::Outbound => remote < local,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
