//! Liveness monitor: periodic heartbeats on connected links.
//!
//! Each connected link owns one heartbeat timer. Replies and inbound
//! heartbeats refresh the peer's `last_seen` in the node; no timeout is
//! enforced on missing replies, a dead link is noticed by the transport.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::identity::ServerId;
use crate::message::{FederationMessage, Heartbeat};
use crate::timer::TimerHandle;
use crate::transport::LinkSender;

/// Start sending `heartbeat` frames on a link every `interval`, the first
/// one an interval after the link connects. The timer stops on its own once
/// the link is closed.
pub fn start_heartbeat(sender: LinkSender, local: ServerId, interval: Duration) -> TimerHandle {
    TimerHandle::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let beat = FederationMessage::Heartbeat(Heartbeat::now(&local));
            if let Err(e) = sender.send(&beat) {
                debug!("Heartbeat on link {} stopped: {e}", sender.link_id());
                break;
            }
        }
    })
}

/// The reply to a peer's heartbeat.
pub fn heartbeat_reply(local: &ServerId) -> FederationMessage {
    FederationMessage::HeartbeatResponse(Heartbeat::now(local))
}
