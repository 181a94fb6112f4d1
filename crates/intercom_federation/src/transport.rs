//! WebSocket transport: listener, dialer and per-link supervisor.
//!
//! Every open link, inbound or outbound, is driven by a single task that owns
//! the socket. It decodes incoming text frames into [`FederationMessage`]s and
//! forwards them to the node's event channel, and it drains the link's own
//! outbound channel, so writes from different callers never interleave. The
//! node only ever holds a [`LinkSender`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::error::FederationError;
use crate::message::FederationMessage;

/// Path the federation endpoint is served under.
pub const FEDERATION_PATH: &str = "/federation";

/// Process-unique id of one physical link.
pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_link_id() -> LinkId {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

#[derive(Debug)]
enum Outgoing {
    Frame(String),
    Close,
}

/// Write handle of a link. Cloning is cheap; all clones feed the same
/// ordered outbound channel.
#[derive(Debug, Clone)]
pub struct LinkSender {
    link_id: LinkId,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl LinkSender {
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Queue a frame on the link. Fails only when the link task has ended.
    pub fn send(&self, message: &FederationMessage) -> Result<(), FederationError> {
        let text = message.to_json()?;
        self.tx
            .send(Outgoing::Frame(text))
            .map_err(|_| FederationError::Connection(format!("link {} is closed", self.link_id)))
    }

    /// Ask the link task to send a close frame and stop. Frames queued
    /// before this call are written first.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// A link sender with no socket behind it; frames land in the returned
/// receiver instead.
#[cfg(test)]
pub(crate) fn test_link(link_id: LinkId) -> (LinkSender, TestLinkReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LinkSender { link_id, tx }, TestLinkReceiver { rx })
}

#[cfg(test)]
pub(crate) struct TestLinkReceiver {
    rx: mpsc::UnboundedReceiver<Outgoing>,
}

#[cfg(test)]
impl TestLinkReceiver {
    /// Next frame written to the link, or `None` once the link was closed.
    pub(crate) async fn next_frame(&mut self) -> Option<FederationMessage> {
        match self.rx.recv().await? {
            Outgoing::Frame(text) => FederationMessage::from_json(&text).ok(),
            Outgoing::Close => None,
        }
    }

    /// Frames written so far, stopping at a close request.
    pub(crate) fn drain(&mut self) -> (Vec<FederationMessage>, bool) {
        let mut frames = Vec::new();
        while let Ok(outgoing) = self.rx.try_recv() {
            match outgoing {
                Outgoing::Frame(text) => frames.extend(FederationMessage::from_json(&text).ok()),
                Outgoing::Close => return (frames, true),
            }
        }
        (frames, false)
    }
}

/// An event raised by a link task or the dialer.
#[derive(Debug)]
pub enum TransportEvent {
    /// The link is open. Always the first event of a link.
    Opened {
        link_id: LinkId,
        direction: Direction,
        remote: String,
        sender: LinkSender,
    },
    /// A frame was received and decoded.
    Frame {
        link_id: LinkId,
        message: FederationMessage,
    },
    /// A frame was received but could not be decoded. `frame_type` is its
    /// `type` field, when it had a readable one.
    Malformed {
        link_id: LinkId,
        frame_type: Option<String>,
        error: FederationError,
    },
    /// The link ended. `error` is set when it ended abnormally.
    Closed {
        link_id: LinkId,
        error: Option<String>,
    },
    /// An outbound dial failed before the link opened.
    DialFailed {
        link_id: LinkId,
        error: FederationError,
    },
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Bind the federation listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, FederationError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Federation listener bound on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept links until `shutdown` fires. Each accepted socket is upgraded on
/// its own task and then supervised by [`run_link`].
pub async fn serve(
    listener: TcpListener,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let events = events.clone();
                    tokio::spawn(accept_link(stream, peer_addr, events));
                }
                Err(e) => {
                    error!("TCP accept failed: {e}");
                }
            },
            _ = shutdown.recv() => {
                info!("Federation listener shutting down");
                break;
            }
        }
    }
}

async fn accept_link(stream: TcpStream, peer_addr: SocketAddr, events: mpsc::Sender<TransportEvent>) {
    let only_federation_path = |request: &Request, response: Response| {
        if request.uri().path().trim_end_matches('/') == FEDERATION_PATH {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("not a federation endpoint".into()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    match accept_hdr_async(stream, only_federation_path).await {
        Ok(ws) => {
            run_link(ws, next_link_id(), Direction::Inbound, peer_addr.to_string(), events).await;
        }
        Err(e) => {
            warn!("WebSocket upgrade from {peer_addr} failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

/// Resolve a peer's advertised URL to its federation endpoint.
pub fn federation_url(server_url: &str) -> Result<String, FederationError> {
    let mut url = url::Url::parse(server_url)
        .map_err(|e| FederationError::Connection(format!("invalid peer URL '{server_url}': {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(FederationError::Connection(format!(
            "peer URL '{server_url}' is not a ws:// or wss:// URL"
        )));
    }
    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with(FEDERATION_PATH) {
        url.set_path(&format!("{path}{FEDERATION_PATH}"));
    }
    Ok(url.to_string())
}

/// Dial a peer and, once connected, supervise the link. A failure before
/// the link opens is reported as [`TransportEvent::DialFailed`].
pub async fn dial(
    link_id: LinkId,
    server_url: String,
    connect_timeout: Duration,
    events: mpsc::Sender<TransportEvent>,
) {
    let connected = async {
        let url = federation_url(&server_url)?;
        debug!("Link {link_id}: dialing {url}");
        let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| FederationError::Timeout(connect_timeout))??;
        Ok::<_, FederationError>(ws)
    }
    .await;

    match connected {
        Ok(ws) => run_link(ws, link_id, Direction::Outbound, server_url, events).await,
        Err(error) => {
            let _ = events.send(TransportEvent::DialFailed { link_id, error }).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Link supervisor
// ---------------------------------------------------------------------------

/// Drive one open link until either side closes it.
async fn run_link<S>(
    ws: WebSocketStream<S>,
    link_id: LinkId,
    direction: Direction,
    remote: String,
    events: mpsc::Sender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sender = LinkSender { link_id, tx };
    let opened = TransportEvent::Opened {
        link_id,
        direction,
        remote: remote.clone(),
        sender,
    };
    if events.send(opened).await.is_err() {
        return;
    }
    debug!("Link {link_id} ({direction:?}) open with {remote}");

    let (mut sink, mut stream) = ws.split();
    let error = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let event = match FederationMessage::from_json(text.as_str()) {
                        Ok(message) => TransportEvent::Frame { link_id, message },
                        Err(error) => TransportEvent::Malformed {
                            link_id,
                            frame_type: FederationMessage::frame_type(text.as_str()),
                            error,
                        },
                    };
                    if events.send(event).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Link {link_id}: {remote} sent close");
                    break None;
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Link {link_id}: ignoring binary frame from {remote}");
                }
                Some(Ok(_)) => {} // ping/pong
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            },
            outgoing = rx.recv() => match outgoing {
                Some(Outgoing::Frame(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        break Some(e.to_string());
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break None;
                }
            },
        }
    };

    if let Some(e) = &error {
        debug!("Link {link_id} with {remote} failed: {e}");
    }
    let _ = events.send(TransportEvent::Closed { link_id, error }).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServerId;
    use crate::message::Heartbeat;

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[test]
    fn test_link_ids_are_unique() {
        let a = next_link_id();
        let b = next_link_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_federation_url() {
        assert_eq!(
            federation_url("ws://10.0.0.2:3002").unwrap(),
            "ws://10.0.0.2:3002/federation"
        );
        assert_eq!(
            federation_url("ws://host:3002/").unwrap(),
            "ws://host:3002/federation"
        );
        assert_eq!(
            federation_url("wss://host/federation").unwrap(),
            "wss://host/federation"
        );
        assert_eq!(
            federation_url("ws://host/intercom").unwrap(),
            "ws://host/intercom/federation"
        );
        assert!(federation_url("http://host:3002").is_err());
        assert!(federation_url("nonsense").is_err());
    }

    #[tokio::test]
    async fn test_link_roundtrip_over_loopback() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        tokio::spawn(serve(listener, events_tx.clone(), shutdown_rx));

        tokio::spawn(dial(
            next_link_id(),
            format!("ws://127.0.0.1:{port}"),
            Duration::from_secs(2),
            events_tx,
        ));

        let mut client = None;
        let mut server_link = None;
        while client.is_none() || server_link.is_none() {
            if let TransportEvent::Opened { direction, sender, link_id, .. } =
                next_event(&mut events_rx).await
            {
                match direction {
                    Direction::Outbound => client = Some(sender),
                    Direction::Inbound => server_link = Some(link_id),
                }
            }
        }
        let client = client.unwrap();
        let server_link = server_link.unwrap();

        let ping = FederationMessage::Heartbeat(Heartbeat::now(&ServerId::from("srv-1")));
        client.send(&ping).unwrap();
        match next_event(&mut events_rx).await {
            TransportEvent::Frame { link_id, message } => {
                assert_eq!(link_id, server_link);
                assert_eq!(message, ping);
            }
            other => panic!("expected frame, got {other:?}"),
        }

        client.close();
        let mut closed = 0;
        while closed < 2 {
            if let TransportEvent::Closed { .. } = next_event(&mut events_rx).await {
                closed += 1;
            }
        }
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_wrong_path_is_refused() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        tokio::spawn(serve(listener, events_tx, shutdown_rx));

        let result = connect_async(format!("ws://127.0.0.1:{port}/admin")).await;
        assert!(result.is_err());

        // The listener never reported a link.
        let nothing = tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        // Grab a free port and release it so nothing is listening there.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let link_id = next_link_id();
        dial(
            link_id,
            format!("ws://127.0.0.1:{port}"),
            Duration::from_secs(2),
            events_tx,
        )
        .await;

        match next_event(&mut events_rx).await {
            TransportEvent::DialFailed { link_id: failed, .. } => assert_eq!(failed, link_id),
            other => panic!("expected dial failure, got {other:?}"),
        }
    }
}
