//! Endpoint connection manager
//!
//! Owns one slot per endpoint (transport handle + outcome of the last
//! attempt) and the `connect` operation that (re)opens it:
//!
//! 1. already open: return true, touch nothing
//! 2. reset the endpoint's subscription entry
//! 3. build auth headers from the current credential (if any)
//! 4. private endpoint without credential: no attempt, stay disconnected
//! 5. otherwise open the transport with the keepalive bundle
//! 6. "already closed" failures log at info, anything else at warn
//! 7. report liveness as re-read from the slot
//!
//! Each slot is guarded by an async mutex held for the whole attempt, so
//! concurrent callers never open two transports for one endpoint.
//! Retry scheduling is left to the caller.

use crate::core::{AuthHeaders, CredentialSource, EndpointError, EndpointType, EndpointUrls};
use crate::infrastructure::config::Config;
use crate::log_ws;
use crate::ws::connection::{
    InboundReceiver, OpenError, OpenRequest, TransportHandle, TransportOpener, WebSocketError,
    WsOpener,
};
use crate::ws::ping::{KeepaliveConfig, OPEN_TIMEOUT};
use crate::ws::subscription::SubscriptionRegistry;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::Level;

/// Result of the latest connect attempt on an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Transport was already open; nothing was done
    AlreadyConnected,
    /// A new transport was opened
    Connected,
    /// Private endpoint with no session credential; no attempt made
    AwaitingCredential,
    /// Peer closed the connection during the open
    Closed(String),
    /// Any other failure
    Failed(String),
}

impl ConnectOutcome {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::AlreadyConnected | ConnectOutcome::Connected)
    }
}

/// Failure inside one attempt; absorbed by `connect`
#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Open(#[from] OpenError),
}

impl ConnectError {
    fn is_closed(&self) -> bool {
        matches!(self, ConnectError::Open(err) if err.is_closed())
    }
}

/// Renders an error followed by its `source()` chain
struct ErrorChain<'a>(&'a (dyn StdError + 'static));

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": caused by {}", err)?;
            source = err.source();
        }
        Ok(())
    }
}

struct EndpointSlot<H> {
    handle: Mutex<Option<H>>,
    last_outcome: parking_lot::Mutex<Option<ConnectOutcome>>,
}

impl<H> EndpointSlot<H> {
    fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            last_outcome: parking_lot::Mutex::new(None),
        }
    }

    fn record(&self, outcome: ConnectOutcome) {
        *self.last_outcome.lock() = Some(outcome);
    }
}

/// Per-endpoint connection state and the connect operation
pub struct ConnectionManager<T: TransportOpener = WsOpener> {
    opener: T,
    credentials: Arc<dyn CredentialSource>,
    subscriptions: Arc<SubscriptionRegistry>,
    urls: EndpointUrls,
    keepalive: KeepaliveConfig,
    open_timeout: Duration,
    slots: [EndpointSlot<T::Handle>; 4],
}

impl ConnectionManager<WsOpener> {
    /// Manager on the tokio-tungstenite transport, configured from `Config`
    pub fn from_config(
        config: &Config,
        credentials: Arc<dyn CredentialSource>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> crate::Result<Self> {
        let urls = config.venue.endpoint_urls()?;
        Ok(Self::new(WsOpener, credentials, subscriptions, urls)
            .with_keepalive(config.keepalive.to_keepalive()?))
    }

    /// Take the endpoint's inbound frame queue
    ///
    /// The receiver is awaited without holding the endpoint slot, so
    /// `connect`/`disconnect` are not blocked by a waiting reader. It ends
    /// when the transport closes; a reconnect hands out a fresh one.
    pub async fn take_inbound(
        &self,
        endpoint: EndpointType,
    ) -> Result<InboundReceiver, WebSocketError> {
        self.with_handle(endpoint, |transport| transport.take_inbound())
            .await?
            .ok_or(WebSocketError::InboundTaken)
    }
}

impl<T: TransportOpener> ConnectionManager<T> {
    /// Manager with default keepalive tunables, every endpoint disconnected
    pub fn new(
        opener: T,
        credentials: Arc<dyn CredentialSource>,
        subscriptions: Arc<SubscriptionRegistry>,
        urls: EndpointUrls,
    ) -> Self {
        Self {
            opener,
            credentials,
            subscriptions,
            urls,
            keepalive: KeepaliveConfig::default(),
            open_timeout: OPEN_TIMEOUT,
            slots: std::array::from_fn(|_| EndpointSlot::new()),
        }
    }

    /// Replace the keepalive tunables (construction time only)
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    #[inline]
    pub fn keepalive(&self) -> &KeepaliveConfig {
        &self.keepalive
    }

    #[inline]
    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    #[inline]
    pub fn opener(&self) -> &T {
        &self.opener
    }

    #[inline]
    fn slot(&self, endpoint: EndpointType) -> &EndpointSlot<T::Handle> {
        &self.slots[endpoint.index()]
    }

    /// Connect an endpoint; returns whether it is connected afterwards
    ///
    /// Safe to call repeatedly: an open endpoint short-circuits without
    /// touching its subscriptions. Failures never propagate; they are
    /// logged and reflected in the return value and `last_outcome`.
    pub async fn connect(&self, endpoint: EndpointType) -> bool {
        let slot = self.slot(endpoint);
        let mut handle = slot.handle.lock().await;

        if handle.as_ref().is_some_and(|h| h.is_open()) {
            log_ws!(Level::INFO, endpoint = %endpoint, "already connected");
            slot.record(ConnectOutcome::AlreadyConnected);
            return true;
        }

        // Whatever is left in the slot is a dead transport
        drop(handle.take());

        let outcome = match self.open_endpoint(endpoint).await {
            Ok(Some(opened)) => {
                *handle = Some(opened);
                ConnectOutcome::Connected
            }
            Ok(None) => ConnectOutcome::AwaitingCredential,
            Err(err) if err.is_closed() => {
                log_ws!(Level::INFO, endpoint = %endpoint, error = %err, "connection already closed");
                *handle = None;
                ConnectOutcome::Closed(err.to_string())
            }
            Err(err) => {
                log_ws!(
                    Level::WARN,
                    endpoint = %endpoint,
                    error = %err,
                    chain = %ErrorChain(&err),
                    detail = ?err,
                    "connect failed"
                );
                *handle = None;
                ConnectOutcome::Failed(err.to_string())
            }
        };
        slot.record(outcome);

        handle.as_ref().is_some_and(|h| h.is_open())
    }

    /// Steps 2-5 of `connect`; `Ok(None)` when waiting for a credential
    async fn open_endpoint(
        &self,
        endpoint: EndpointType,
    ) -> Result<Option<T::Handle>, ConnectError> {
        self.subscriptions.reset(endpoint);

        let credential = self.credentials.current();
        let headers = AuthHeaders::from_credential(credential.as_ref());

        if endpoint.requires_credential() && credential.is_none() {
            log_ws!(Level::INFO, endpoint = %endpoint, "waiting for session credential");
            return Ok(None);
        }

        // Public endpoints carry the headers too when a session exists
        let request = OpenRequest {
            url: self.urls.get(endpoint)?.to_string(),
            headers,
            open_timeout: self.open_timeout,
            keepalive: self.keepalive,
        };

        let opened = self.opener.open(&request).await?;
        log_ws!(
            Level::INFO,
            endpoint = %endpoint,
            url = %request.url,
            headers = %request.headers.summary(),
            "connected"
        );
        Ok(Some(opened))
    }

    /// Connect every endpoint once, in `EndpointType::ALL` order
    pub async fn connect_all(&self) -> HashMap<EndpointType, bool> {
        let mut results = HashMap::with_capacity(EndpointType::ALL.len());
        for endpoint in EndpointType::ALL {
            results.insert(endpoint, self.connect(endpoint).await);
        }
        results
    }

    /// Close an endpoint and clear its subscriptions
    ///
    /// Returns whether a transport was present.
    pub async fn disconnect(&self, endpoint: EndpointType) -> bool {
        let mut handle = self.slot(endpoint).handle.lock().await;
        self.subscriptions.reset(endpoint);

        let Some(current) = handle.take() else {
            return false;
        };
        current.close().await;
        log_ws!(Level::INFO, endpoint = %endpoint, "disconnected");
        true
    }

    /// Close every endpoint
    pub async fn disconnect_all(&self) {
        for endpoint in EndpointType::ALL {
            self.disconnect(endpoint).await;
        }
    }

    /// Whether the endpoint holds a transport that reports itself open
    pub async fn is_endpoint_connected(&self, endpoint: EndpointType) -> bool {
        self.slot(endpoint)
            .handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.is_open())
    }

    /// Outcome of the latest connect attempt, if any
    pub fn last_outcome(&self, endpoint: EndpointType) -> Option<ConnectOutcome> {
        self.slot(endpoint).last_outcome.lock().clone()
    }

    /// Run `f` against the endpoint's open transport
    pub async fn with_handle<R>(
        &self,
        endpoint: EndpointType,
        f: impl FnOnce(&mut T::Handle) -> R,
    ) -> Result<R, WebSocketError> {
        let mut handle = self.slot(endpoint).handle.lock().await;
        match handle.as_mut() {
            Some(h) if h.is_open() => Ok(f(h)),
            _ => Err(WebSocketError::NotConnected),
        }
    }
}
