//! WebSocket endpoint
//!
//! Used on both sides of the relay link: the manager wraps every accepted
//! follower or viewer connection (axum), and a follower wraps its connection
//! to the manager (tungstenite). One text frame carries one payload.
//!
//! A manager handing its session to another closes follower links with
//! close code 1012, which a follower reads as [`Departure::SessionMoved`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::discovery::PeerAddress;
use crate::error::{Error, Result};
use crate::session::SessionName;

use super::endpoint::{Departure, Endpoint, EndpointKind};

/// First path segment of the relay WebSocket route
pub const RELAY_ROUTE: &str = "relay";

/// Query marking a read-only browser connection
pub const VIEWER_QUERY: &str = "role=viewer";

/// Close code telling followers the session moved ("service restart")
pub const SESSION_MOVED_CODE: u16 = 1012;

const SESSION_MOVED_REASON: &str = "session moved";

/// Follower connection to its manager
pub type UpstreamSocket = SocketEndpoint<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ─────────────────────────────────────────────────────────────────
// Routes
// ─────────────────────────────────────────────────────────────────

/// Percent-encoded path of a session's relay route, `/relay/<name>`
pub fn relay_path(session: &SessionName) -> Result<String> {
    Ok(relay_url_for("localhost", session)?.path().to_string())
}

fn relay_url(manager: PeerAddress, session: &SessionName) -> Result<Url> {
    relay_url_for(&manager.to_string(), session)
}

fn relay_url_for(authority: &str, session: &SessionName) -> Result<Url> {
    let mut url = Url::parse(&format!("ws://{}/", authority))
        .map_err(|e| Error::Internal(format!("bad relay authority '{}': {}", authority, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::Internal("relay URL cannot be a base".to_string()))?
        .clear()
        .push(RELAY_ROUTE)
        .push(session.as_str());
    Ok(url)
}

// ─────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────

/// A received frame, reduced to what the relay cares about
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<u16>),
    Control,
}

/// Message type of a WebSocket library the relay can run over
pub trait RelayFrame: Sized + Send {
    type Error: std::error::Error + Into<Error> + Send;

    fn text(payload: &str) -> Self;

    fn close(departure: Departure) -> Self;

    fn into_frame(self) -> Frame;

    /// Errors that just mean the connection is already gone
    fn is_closed(_err: &Self::Error) -> bool {
        false
    }
}

impl RelayFrame for WsMessage {
    type Error = WsError;

    fn text(payload: &str) -> Self {
        WsMessage::Text(payload.to_string())
    }

    fn close(departure: Departure) -> Self {
        match departure {
            Departure::Closed => WsMessage::Close(None),
            Departure::SessionMoved => WsMessage::Close(Some(CloseFrame {
                code: CloseCode::from(SESSION_MOVED_CODE),
                reason: SESSION_MOVED_REASON.into(),
            })),
        }
    }

    fn into_frame(self) -> Frame {
        match self {
            WsMessage::Text(text) => Frame::Text(text),
            WsMessage::Binary(data) => Frame::Binary(data),
            WsMessage::Close(frame) => Frame::Close(frame.map(|f| u16::from(f.code))),
            _ => Frame::Control,
        }
    }

    fn is_closed(err: &WsError) -> bool {
        matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
    }
}

impl RelayFrame for AxumMessage {
    type Error = axum::Error;

    fn text(payload: &str) -> Self {
        AxumMessage::Text(payload.to_owned().into())
    }

    fn close(departure: Departure) -> Self {
        match departure {
            Departure::Closed => AxumMessage::Close(None),
            Departure::SessionMoved => AxumMessage::Close(Some(AxumCloseFrame {
                code: SESSION_MOVED_CODE,
                reason: SESSION_MOVED_REASON.into(),
            })),
        }
    }

    fn into_frame(self) -> Frame {
        match self {
            AxumMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
            AxumMessage::Binary(data) => Frame::Binary(data.to_vec()),
            AxumMessage::Close(frame) => Frame::Close(frame.map(|f| f.code)),
            _ => Frame::Control,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────

/// A WebSocket connection as a relay endpoint
pub struct SocketEndpoint<S> {
    stream: S,
    kind: EndpointKind,
    peer: String,
    departure: Departure,
}

impl<S> SocketEndpoint<S> {
    pub fn new(stream: S, kind: EndpointKind, peer: impl Into<String>) -> Self {
        Self {
            stream,
            kind,
            peer: peer.into(),
            departure: Departure::Closed,
        }
    }

    /// Remote address, for logs
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl<S> fmt::Debug for SocketEndpoint<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketEndpoint")
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("departure", &self.departure)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S, M> Endpoint for SocketEndpoint<S>
where
    M: RelayFrame,
    S: Stream<Item = std::result::Result<M, M::Error>> + Sink<M, Error = M::Error> + Unpin + Send,
{
    fn kind(&self) -> EndpointKind {
        self.kind
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) if M::is_closed(&e) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            };

            match message.into_frame() {
                Frame::Text(text) => return Ok(Some(text)),
                Frame::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => warn!(peer = %self.peer, "Dropping binary frame that is not UTF-8"),
                },
                Frame::Close(code) => {
                    debug!(peer = %self.peer, code = ?code, "Close frame received");
                    if code == Some(SESSION_MOVED_CODE) {
                        self.departure = Departure::SessionMoved;
                    }
                    return Ok(None);
                }
                // Ping/pong are answered by the WebSocket library
                Frame::Control => {}
            }
        }
    }

    async fn send(&mut self, payload: &str) -> Result<()> {
        self.stream.send(M::text(payload)).await.map_err(Into::into)
    }

    fn peer_departure(&self) -> Departure {
        self.departure
    }

    async fn close(&mut self, departure: Departure) {
        if departure == Departure::SessionMoved {
            if let Err(e) = self.stream.send(M::close(departure)).await {
                debug!(peer = %self.peer, error = %e, "Could not send close frame");
            }
        }
        if let Err(e) = self.stream.close().await {
            debug!(peer = %self.peer, error = %e, "Close handshake incomplete");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Follower Connect
// ─────────────────────────────────────────────────────────────────

/// Connect a follower to its manager's relay route
///
/// Retries briefly with backoff: the manager may have answered discovery
/// before its listener is ready.
pub async fn connect_upstream(
    manager: PeerAddress,
    session: &SessionName,
    max_elapsed: Duration,
) -> Result<UpstreamSocket> {
    let url = relay_url(manager, session)?;
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    };

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match connect_async(url.as_str()).await {
            Ok((ws_stream, _response)) => {
                info!(url = %url, attempts = attempts, "Connected to manager");
                return Ok(SocketEndpoint::new(
                    ws_stream,
                    EndpointKind::Upstream,
                    manager.to_string(),
                ));
            }
            Err(e) => match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        url = %url,
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Manager connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(Error::ConnectFailed {
                        url: url.to_string(),
                        message: e.to_string(),
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Scripted frames in, captured frames out
    struct ScriptedSocket {
        incoming: stream::Iter<std::vec::IntoIter<std::result::Result<WsMessage, WsError>>>,
        sent: Vec<WsMessage>,
    }

    impl ScriptedSocket {
        fn new(frames: Vec<std::result::Result<WsMessage, WsError>>) -> Self {
            Self {
                incoming: stream::iter(frames),
                sent: Vec::new(),
            }
        }
    }

    impl Stream for ScriptedSocket {
        type Item = std::result::Result<WsMessage, WsError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.incoming).poll_next(cx)
        }
    }

    impl Sink<WsMessage> for ScriptedSocket {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: WsMessage) -> std::result::Result<(), WsError> {
            self.sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }

    fn endpoint(frames: Vec<std::result::Result<WsMessage, WsError>>) -> SocketEndpoint<ScriptedSocket> {
        SocketEndpoint::new(ScriptedSocket::new(frames), EndpointKind::Follower, "test")
    }

    #[test]
    fn test_relay_path() {
        let session = SessionName::new("room1").unwrap();
        assert_eq!(relay_path(&session).unwrap(), "/relay/room1");
    }

    #[test]
    fn test_relay_path_is_encoded() {
        let session = SessionName::new("a?b#c%").unwrap();
        assert_eq!(relay_path(&session).unwrap(), "/relay/a%3Fb%23c%25");
    }

    #[test]
    fn test_relay_url() {
        let session = SessionName::new("room1").unwrap();
        let url = relay_url("192.168.1.7:2975".parse().unwrap(), &session).unwrap();
        assert_eq!(url.as_str(), "ws://192.168.1.7:2975/relay/room1");
    }

    #[tokio::test]
    async fn test_text_and_utf8_binary_frames() {
        let mut ep = endpoint(vec![
            Ok(WsMessage::Text("hi\n".to_string())),
            Ok(WsMessage::Ping(vec![1])),
            Ok(WsMessage::Binary(vec![0xff, 0xfe])),
            Ok(WsMessage::Binary(b"bin\n".to_vec())),
        ]);
        assert_eq!(ep.recv().await.unwrap().as_deref(), Some("hi\n"));
        assert_eq!(ep.recv().await.unwrap().as_deref(), Some("bin\n"));
        assert_eq!(ep.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_frame_ends_stream() {
        let mut ep = endpoint(vec![
            Ok(WsMessage::Close(None)),
            Ok(WsMessage::Text("late\n".to_string())),
        ]);
        assert_eq!(ep.recv().await.unwrap(), None);
        assert_eq!(ep.peer_departure(), Departure::Closed);
    }

    #[tokio::test]
    async fn test_moved_close_code_is_recognised() {
        let mut ep = endpoint(vec![Ok(<WsMessage as RelayFrame>::close(Departure::SessionMoved))]);
        assert_eq!(ep.recv().await.unwrap(), None);
        assert_eq!(ep.peer_departure(), Departure::SessionMoved);
    }

    #[tokio::test]
    async fn test_close_tells_peer_the_session_moved() {
        let mut ep = endpoint(vec![]);
        ep.close(Departure::SessionMoved).await;
        assert_eq!(ep.stream.sent.len(), 1);
        assert_eq!(
            ep.stream.sent[0].clone().into_frame(),
            Frame::Close(Some(SESSION_MOVED_CODE))
        );

        let mut plain = endpoint(vec![]);
        plain.close(Departure::Closed).await;
        assert!(plain.stream.sent.is_empty());
    }

    #[test]
    fn test_axum_frames() {
        let text = <AxumMessage as RelayFrame>::text("hi\n");
        assert_eq!(text.into_frame(), Frame::Text("hi\n".to_string()));

        let moved = <AxumMessage as RelayFrame>::close(Departure::SessionMoved);
        assert_eq!(moved.into_frame(), Frame::Close(Some(SESSION_MOVED_CODE)));

        let closed = <AxumMessage as RelayFrame>::close(Departure::Closed);
        assert_eq!(closed.into_frame(), Frame::Close(None));
    }

    #[test]
    fn test_debug_shows_peer() {
        let ep = endpoint(vec![]);
        let shown = format!("{:?}", ep);
        assert!(shown.contains("Follower"));
        assert!(shown.contains("test"));
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let mut ep = endpoint(vec![Err(WsError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )))]);
        assert!(ep.recv().await.is_err());

        let mut closed = endpoint(vec![Err(WsError::ConnectionClosed)]);
        assert_eq!(closed.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_is_one_text_frame() {
        let mut ep = endpoint(vec![]);
        ep.send("line\n").await.unwrap();
        assert_eq!(ep.stream.sent, vec![WsMessage::Text("line\n".to_string())]);
    }

    #[tokio::test]
    async fn test_connect_upstream_gives_up() {
        // Nothing listens here once the listener is dropped
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = SessionName::new("room1").unwrap();
        let err = connect_upstream(addr.into(), &session, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
    }
}
