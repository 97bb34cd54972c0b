//! Websocket transport for venue endpoints
//!
//! `WsOpener` performs the handshake with tokio-tungstenite and hands back a
//! `WsTransport`. A single driver task owns the socket:
//! - answers nothing itself (tungstenite queues pongs for incoming pings)
//! - sends keepalive pings and drops the socket when a pong is overdue
//! - forwards data frames into the inbound queue (bounded by `max_queue`)
//! - writes outbound frames queued by `send_text` / `send_binary`
//!
//! The manager only depends on the `TransportOpener` / `TransportHandle`
//! traits, so tests swap in a scripted transport.

use crate::core::AuthHeaders;
use crate::log_ws;
use crate::ws::ping::{KeepaliveConfig, KeepaliveMonitor};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::future::{pending, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    error::ProtocolError,
    http::{HeaderName, HeaderValue},
    protocol::{Message, WebSocketConfig},
    Error as WsError,
};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::Level;
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Extra time granted to the driver on top of the close timeout
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Everything needed to open one endpoint
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub url: String,
    pub headers: AuthHeaders,
    pub open_timeout: Duration,
    pub keepalive: KeepaliveConfig,
}

/// Failure to open a transport
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// Peer closed (or had already closed) the connection
    #[error("connection already closed: {0}")]
    Closed(String),
    #[error("open timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid handshake request: {0}")]
    InvalidRequest(String),
    #[error("websocket handshake failed: {0}")]
    Transport(#[source] Box<WsError>),
}

impl OpenError {
    /// Whether this is the routine closed-connection family
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, OpenError::Closed(_))
    }
}

impl From<WsError> for OpenError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                OpenError::Closed(err.to_string())
            }
            other => OpenError::Transport(Box::new(other)),
        }
    }
}

/// Errors using an open transport
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Inbound queue already taken")]
    InboundTaken,
}

/// A live bidirectional transport for one endpoint
pub trait TransportHandle: Send + 'static {
    /// Liveness as seen by the transport itself
    fn is_open(&self) -> bool;

    /// Close handshake, bounded by the keepalive close timeout
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Opens transports for endpoints
pub trait TransportOpener: Send + Sync {
    type Handle: TransportHandle;

    fn open(
        &self,
        request: &OpenRequest,
    ) -> impl Future<Output = Result<Self::Handle, OpenError>> + Send;
}

/// Opener backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsOpener;

impl TransportOpener for WsOpener {
    type Handle = WsTransport;

    async fn open(&self, request: &OpenRequest) -> Result<WsTransport, OpenError> {
        WsTransport::connect(request).await
    }
}

enum Outbound {
    Frame(Message),
    Close,
}

enum InboundTx {
    Bounded(mpsc::Sender<Message>),
    Unbounded(mpsc::UnboundedSender<Message>),
}

impl InboundTx {
    /// Wait for queue capacity; `None` once the receiving side is gone
    async fn reserve(&self) -> Option<InboundPermit<'_>> {
        match self {
            InboundTx::Bounded(tx) => tx.reserve().await.ok().map(InboundPermit::Bounded),
            InboundTx::Unbounded(tx) => (!tx.is_closed()).then_some(InboundPermit::Unbounded(tx)),
        }
    }
}

enum InboundPermit<'a> {
    Bounded(mpsc::Permit<'a, Message>),
    Unbounded(&'a mpsc::UnboundedSender<Message>),
}

impl InboundPermit<'_> {
    fn send(self, msg: Message) {
        match self {
            InboundPermit::Bounded(permit) => permit.send(msg),
            // A receiver dropped since `reserve` shows up on the next reserve
            InboundPermit::Unbounded(tx) => {
                let _ = tx.send(msg);
            }
        }
    }
}

/// Inbound data frames of one transport
///
/// Bounded by `max_queue`. Dropping it closes the connection.
#[derive(Debug)]
pub enum InboundReceiver {
    Bounded(mpsc::Receiver<Message>),
    Unbounded(mpsc::UnboundedReceiver<Message>),
}

impl InboundReceiver {
    /// Next data frame; `None` once the socket is gone and drained
    pub async fn recv(&mut self) -> Option<Message> {
        match self {
            InboundReceiver::Bounded(rx) => rx.recv().await,
            InboundReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Next data frame if one is already queued
    pub fn try_recv(&mut self) -> Option<Message> {
        match self {
            InboundReceiver::Bounded(rx) => rx.try_recv().ok(),
            InboundReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

fn inbound_queue(max_queue: Option<usize>) -> (InboundTx, InboundReceiver) {
    match max_queue {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (InboundTx::Bounded(tx), InboundReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (InboundTx::Unbounded(tx), InboundReceiver::Unbounded(rx))
        }
    }
}

/// Clears the liveness flag when the driver ends, panics included
struct OpenGuard(Arc<AtomicBool>);

impl OpenGuard {
    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

/// tungstenite limits derived from the keepalive bundle
fn ws_config(keepalive: &KeepaliveConfig) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = keepalive.max_size;
    config.max_frame_size = keepalive.max_size;
    config
}

/// Why the driver stopped
#[derive(Debug)]
enum DriverExit {
    LocalClose,
    PeerClosed(Option<String>),
    KeepaliveTimeout,
    ReceiverDropped,
    StreamEnded,
    Error(String),
}

impl fmt::Display for DriverExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverExit::LocalClose => f.write_str("closed locally"),
            DriverExit::PeerClosed(Some(frame)) => write!(f, "closed by peer: {}", frame),
            DriverExit::PeerClosed(None) => f.write_str("closed by peer"),
            DriverExit::KeepaliveTimeout => f.write_str("pong not received in time"),
            DriverExit::ReceiverDropped => f.write_str("inbound receiver dropped"),
            DriverExit::StreamEnded => f.write_str("stream ended"),
            DriverExit::Error(err) => write!(f, "transport error: {}", err),
        }
    }
}

/// Open websocket to one endpoint
pub struct WsTransport {
    id: Uuid,
    url: String,
    open: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: Option<InboundReceiver>,
    driver: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl WsTransport {
    /// Handshake and start the driver task
    ///
    /// The handshake is bounded by `request.open_timeout`. TCP_NODELAY is
    /// set on the socket.
    pub async fn connect(request: &OpenRequest) -> Result<Self, OpenError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| OpenError::InvalidRequest(e.to_string()))?;

        for (name, value) in request.headers.iter() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| OpenError::InvalidRequest(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| OpenError::InvalidRequest(e.to_string()))?;
            ws_request.headers_mut().insert(name, value);
        }

        let handshake =
            connect_async_with_config(ws_request, Some(ws_config(&request.keepalive)), true);
        let (stream, _response) = timeout(request.open_timeout, handshake)
            .await
            .map_err(|_| OpenError::Timeout(request.open_timeout))??;

        let id = Uuid::new_v4();
        let open = Arc::new(AtomicBool::new(true));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = inbound_queue(request.keepalive.max_queue);

        let driver = tokio::spawn(drive(
            stream,
            outbound_rx,
            inbound_tx,
            request.keepalive,
            Arc::clone(&open),
            id,
        ));

        Ok(Self {
            id,
            url: request.url.clone(),
            open,
            outbound: outbound_tx,
            inbound: Some(inbound_rx),
            driver: Some(driver),
            close_timeout: request.keepalive.close_timeout,
        })
    }

    /// Connection id used in log records
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a text frame
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), WebSocketError> {
        self.send(Message::text(text.into()))
    }

    /// Queue a binary frame
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), WebSocketError> {
        self.send(Message::binary(data.into()))
    }

    fn send(&self, msg: Message) -> Result<(), WebSocketError> {
        if !self.is_open() {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.outbound
            .send(Outbound::Frame(msg))
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    /// Next inbound data frame; `None` once the socket is gone and drained
    /// or the receiver was taken
    pub async fn recv(&mut self) -> Option<Message> {
        match self.inbound.as_mut() {
            Some(inbound) => inbound.recv().await,
            None => None,
        }
    }

    /// Next inbound data frame if one is already queued
    pub fn try_recv(&mut self) -> Option<Message> {
        self.inbound.as_mut().and_then(InboundReceiver::try_recv)
    }

    /// Move the inbound queue out so it can be awaited without the handle
    ///
    /// Later `recv`/`try_recv` calls on the transport return `None`.
    pub fn take_inbound(&mut self) -> Option<InboundReceiver> {
        self.inbound.take()
    }

    /// Close handshake; the driver is aborted if it overruns the close timeout
    pub async fn close(mut self) {
        let _ = self.outbound.send(Outbound::Close);
        let Some(driver) = self.driver.take() else {
            return;
        };

        let abort = driver.abort_handle();
        if timeout(self.close_timeout.saturating_add(CLOSE_GRACE), driver).await.is_err() {
            log_ws!(Level::WARN, connection = %self.id, url = %self.url, "close timed out, aborting driver");
            abort.abort();
        }
        self.open.store(false, Ordering::Release);
    }
}

impl TransportHandle for WsTransport {
    fn is_open(&self) -> bool {
        WsTransport::is_open(self)
    }

    async fn close(self) {
        WsTransport::close(self).await
    }
}

impl fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTransport")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("open", &self.is_open())
            .finish()
    }
}

async fn next_tick(pinger: &mut Option<Interval>) {
    match pinger {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn ping_ticker(period: Option<Duration>) -> Option<Interval> {
    let period = period?;
    // A period too large to schedule means no pings
    let start = Instant::now().checked_add(period)?;
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

/// Owns the socket until it closes
///
/// At most one data frame waits for queue capacity. While it waits the
/// socket is not read, but pings, the pong deadline and outbound frames
/// keep running, so a stalled consumer still ends in a keepalive timeout.
async fn drive(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: InboundTx,
    keepalive: KeepaliveConfig,
    open: Arc<AtomicBool>,
    id: Uuid,
) {
    let open = OpenGuard(open);
    let (mut sink, mut source) = stream.split();
    let mut monitor = KeepaliveMonitor::new(&keepalive);
    let mut pinger = ping_ticker(keepalive.ping_interval);
    let mut undelivered: Option<Message> = None;

    let exit = loop {
        let deadline = monitor.pong_deadline();

        tokio::select! {
            frame = source.next(), if undelivered.is_none() => match frame {
                Some(Ok(Message::Pong(payload))) => {
                    if monitor.on_pong(&payload, Instant::now()) {
                        log_ws!(Level::TRACE, connection = %id, rtt = ?monitor.last_rtt(), "pong");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break DriverExit::PeerClosed(frame.map(|f| f.to_string()));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(msg)) => undelivered = Some(msg),
                Some(Err(err)) => break DriverExit::Error(err.to_string()),
                None => break DriverExit::StreamEnded,
            },
            permit = inbound.reserve(), if undelivered.is_some() => match (permit, undelivered.take()) {
                (Some(permit), Some(msg)) => permit.send(msg),
                (None, _) => break DriverExit::ReceiverDropped,
                (Some(_), None) => {}
            },
            command = outbound.recv() => match command {
                Some(Outbound::Frame(msg)) => {
                    if let Err(err) = sink.send(msg).await {
                        break DriverExit::Error(err.to_string());
                    }
                }
                Some(Outbound::Close) | None => break DriverExit::LocalClose,
            },
            _ = next_tick(&mut pinger) => {
                let payload = monitor.next_ping(Instant::now());
                if let Err(err) = sink.send(Message::Ping(payload)).await {
                    break DriverExit::Error(err.to_string());
                }
            }
            _ = wait_until(deadline) => break DriverExit::KeepaliveTimeout,
        }
    };

    open.clear();

    match &exit {
        DriverExit::KeepaliveTimeout | DriverExit::Error(_) => {
            log_ws!(Level::WARN, connection = %id, reason = %exit, "connection lost");
        }
        _ => {
            log_ws!(Level::INFO, connection = %id, reason = %exit, "connection closed");
        }
    }

    // Close handshake; errors here only mean the socket is already gone
    let _ = timeout(keepalive.close_timeout, async {
        let _ = sink.close().await;
        while let Some(Ok(frame)) = source.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn request(url: String, keepalive: KeepaliveConfig) -> OpenRequest {
        OpenRequest {
            url,
            headers: AuthHeaders::default(),
            open_timeout: Duration::from_secs(5),
            keepalive,
        }
    }

    #[test]
    fn test_closed_family_classification() {
        assert!(OpenError::from(WsError::ConnectionClosed).is_closed());
        assert!(OpenError::from(WsError::AlreadyClosed).is_closed());
        assert!(OpenError::from(WsError::Protocol(
            ProtocolError::ResetWithoutClosingHandshake
        ))
        .is_closed());
    }

    #[test]
    fn test_other_errors_are_not_closed() {
        let refused = WsError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let err = OpenError::from(refused);
        assert!(!err.is_closed());
        assert!(matches!(err, OpenError::Transport(_)));

        assert!(!OpenError::Timeout(Duration::from_secs(5)).is_closed());
        assert!(!OpenError::InvalidRequest("bad header".to_string()).is_closed());
    }

    #[test]
    fn test_ws_config_limits() {
        let unbounded = ws_config(&KeepaliveConfig::default());
        assert_eq!(unbounded.max_message_size, None);
        assert_eq!(unbounded.max_frame_size, None);

        let limited = ws_config(&KeepaliveConfig {
            max_size: Some(1 << 20),
            ..Default::default()
        });
        assert_eq!(limited.max_message_size, Some(1 << 20));
        assert_eq!(limited.max_frame_size, Some(1 << 20));
    }

    #[tokio::test]
    async fn test_bounded_inbound_queue() {
        let (tx, mut rx) = inbound_queue(Some(1));
        tx.reserve().await.unwrap().send(Message::text("a"));

        // Full queue: no capacity until the consumer reads
        let blocked = timeout(Duration::from_millis(20), tx.reserve()).await;
        assert!(blocked.is_err());

        assert_eq!(rx.try_recv(), Some(Message::text("a")));
        assert_eq!(rx.try_recv(), None);
        drop(rx);
        assert!(tx.reserve().await.is_none());
    }

    #[tokio::test]
    async fn test_unbounded_inbound_queue() {
        let (tx, mut rx) = inbound_queue(None);
        for n in 0..3 {
            tx.reserve().await.unwrap().send(Message::text(n.to_string()));
        }
        assert_eq!(rx.recv().await, Some(Message::text("0")));
        drop(rx);
        assert!(tx.reserve().await.is_none());
    }

    #[tokio::test]
    async fn test_open_flag_cleared_when_driver_panics() {
        let open = Arc::new(AtomicBool::new(true));
        let guard = OpenGuard(Arc::clone(&open));

        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("driver failure");
        });

        assert!(task.await.is_err());
        assert!(!open.load(Ordering::Acquire));
    }

    #[test]
    fn test_unschedulable_ping_interval_disables_pings() {
        assert!(ping_ticker(None).is_none());
        assert!(ping_ticker(Some(Duration::MAX)).is_none());
    }

    #[tokio::test]
    async fn test_huge_ping_interval_keeps_driver_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let keepalive = KeepaliveConfig {
            ping_interval: Some(Duration::MAX),
            ping_timeout: Some(Duration::MAX),
            ..Default::default()
        };
        let transport = WsTransport::connect(&request(format!("ws://{}", addr), keepalive))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.is_open());
        assert!(transport.send_text("still alive").is_ok());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_stalled_consumer_still_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for n in 0..5 {
                ws.send(Message::text(format!("frame {}", n))).await.ok();
            }
            // Never read again, so pings stay unanswered
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let keepalive = KeepaliveConfig {
            ping_interval: Some(Duration::from_millis(50)),
            ping_timeout: Some(Duration::from_millis(100)),
            close_timeout: Duration::from_millis(100),
            max_queue: Some(1),
            ..Default::default()
        };
        let mut transport = WsTransport::connect(&request(format!("ws://{}", addr), keepalive))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_millis(1500);
        while transport.is_open() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!transport.is_open());
        // The one frame that fit the queue is still readable
        assert_eq!(transport.try_recv(), Some(Message::text("frame 0")));
    }

    #[tokio::test]
    async fn test_take_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::text("snapshot")).await.ok();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut transport =
            WsTransport::connect(&request(format!("ws://{}", addr), KeepaliveConfig::default()))
                .await
                .unwrap();
        let mut inbound = transport.take_inbound().unwrap();

        let frame = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap();
        assert_eq!(frame, Some(Message::text("snapshot")));
        assert!(transport.take_inbound().is_none());
        assert_eq!(transport.try_recv(), None);
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let err = WsTransport::connect(&request("not a url".to_string(), KeepaliveConfig::default()))
            .await
            .unwrap_err();
        assert!(!err.is_closed());
    }

    #[tokio::test]
    async fn test_echo_roundtrip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        });

        let mut transport =
            WsTransport::connect(&request(format!("ws://{}", addr), KeepaliveConfig::default()))
                .await
                .unwrap();
        assert!(transport.is_open());

        transport.send_text("{\"method\":\"subscribe\"}").unwrap();
        let echoed = timeout(Duration::from_secs(2), transport.recv()).await.unwrap();
        assert_eq!(echoed, Some(Message::text("{\"method\":\"subscribe\"}")));

        let open = Arc::clone(&transport.open);
        transport.close().await;
        assert!(!open.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_peer_close_marks_transport_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.close(None).await.ok();
        });

        let transport =
            WsTransport::connect(&request(format!("ws://{}", addr), KeepaliveConfig::default()))
                .await
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.is_open() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!transport.is_open());
        assert!(transport.send_text("late").is_err());
    }
}
