//! WebSocket connections to the venue endpoints

pub mod connection;
pub mod manager;
pub mod ping;
pub mod subscription;

pub use connection::{
    InboundReceiver, OpenError, OpenRequest, TransportHandle, TransportOpener, WebSocketError,
    WsOpener, WsTransport,
};
pub use manager::{ConnectOutcome, ConnectionManager};
pub use ping::{KeepaliveConfig, KeepaliveMonitor};
pub use subscription::{StreamState, SubscriptionRegistry, SubscriptionStatus};
