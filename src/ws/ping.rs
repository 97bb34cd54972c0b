//! Keepalive tunables and ping/pong tracking
//!
//! Long-lived venue streams sit behind load balancers that drop idle TCP
//! sessions and occasionally reset them without a close frame. The transport
//! driver pings on a fixed interval and drops the socket when a ping goes
//! unanswered past the pong timeout, so a dead stream surfaces as a closed
//! endpoint instead of silence.

use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// Default ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
/// Default pong timeout
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Default close handshake timeout
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Handshake timeout, not configurable
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive tunables applied to every transport open
///
/// Fixed at manager construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between pings; `None` disables pings
    pub ping_interval: Option<Duration>,
    /// Time to wait for the pong; `None` never times out
    pub ping_timeout: Option<Duration>,
    /// Upper bound on the close handshake
    pub close_timeout: Duration,
    /// Inbound message queue capacity; `None` is unbounded
    pub max_queue: Option<usize>,
    /// Largest accepted message in bytes; `None` is unbounded
    pub max_size: Option<usize>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            ping_timeout: Some(DEFAULT_PING_TIMEOUT),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_queue: None,
            max_size: None,
        }
    }
}

/// Tracks outstanding pings for one connection
///
/// Ping payloads carry a big-endian sequence number. A pong answers the
/// outstanding ping when its sequence is at least the outstanding one, so
/// a late pong for a newer ping also settles older ones.
#[derive(Debug)]
pub struct KeepaliveMonitor {
    ping_timeout: Option<Duration>,
    /// Next sequence number to send
    next_seq: u64,
    /// Oldest unanswered ping (sequence, sent at)
    outstanding: Option<(u64, Instant)>,
    /// Round trip of the last answered ping
    last_rtt: Option<Duration>,
    /// Last time the peer answered
    last_pong: Option<Instant>,
}

impl KeepaliveMonitor {
    pub fn new(config: &KeepaliveConfig) -> Self {
        Self {
            ping_timeout: config.ping_timeout,
            next_seq: 0,
            outstanding: None,
            last_rtt: None,
            last_pong: None,
        }
    }

    /// Register a ping sent at `now` and return its payload
    ///
    /// An already outstanding ping keeps its deadline.
    pub fn next_ping(&mut self, now: Instant) -> Bytes {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.outstanding.is_none() {
            self.outstanding = Some((seq, now));
        }
        Bytes::copy_from_slice(&seq.to_be_bytes())
    }

    /// Record a pong; returns true if it answered the outstanding ping
    pub fn on_pong(&mut self, payload: &[u8], now: Instant) -> bool {
        let Some((seq, sent_at)) = self.outstanding else {
            return false;
        };
        let Ok(raw) = <[u8; 8]>::try_from(payload) else {
            return false;
        };
        let answered = u64::from_be_bytes(raw);
        // Ignore pongs for pings we never sent
        if answered < seq || answered >= self.next_seq {
            return false;
        }

        self.outstanding = None;
        self.last_rtt = Some(now.saturating_duration_since(sent_at));
        self.last_pong = Some(now);
        true
    }

    /// When the outstanding ping expires, if one is outstanding
    ///
    /// A timeout too large to represent never expires.
    pub fn pong_deadline(&self) -> Option<Instant> {
        let (_, sent_at) = self.outstanding?;
        sent_at.checked_add(self.ping_timeout?)
    }

    /// Whether the outstanding ping went unanswered for too long
    pub fn is_expired(&self, now: Instant) -> bool {
        self.pong_deadline().is_some_and(|deadline| now >= deadline)
    }

    #[inline]
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    #[inline]
    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    #[inline]
    pub fn is_awaiting_pong(&self) -> bool {
        self.outstanding.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KeepaliveConfig::default();
        assert_eq!(config.ping_interval, Some(Duration::from_secs(20)));
        assert_eq!(config.ping_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert_eq!(config.max_queue, None);
        assert_eq!(config.max_size, None);
        assert_eq!(OPEN_TIMEOUT, Duration::from_secs(5));
    }

    #[test]
    fn test_pong_clears_outstanding_ping() {
        let mut monitor = KeepaliveMonitor::new(&KeepaliveConfig::default());
        let start = Instant::now();

        let payload = monitor.next_ping(start);
        assert!(monitor.is_awaiting_pong());
        assert_eq!(monitor.pong_deadline(), Some(start + Duration::from_secs(10)));

        let later = start + Duration::from_millis(40);
        assert!(monitor.on_pong(&payload, later));
        assert!(!monitor.is_awaiting_pong());
        assert_eq!(monitor.last_rtt(), Some(Duration::from_millis(40)));
        assert_eq!(monitor.last_pong(), Some(later));
        assert_eq!(monitor.pong_deadline(), None);
    }

    #[test]
    fn test_second_ping_keeps_first_deadline() {
        let mut monitor = KeepaliveMonitor::new(&KeepaliveConfig::default());
        let start = Instant::now();

        monitor.next_ping(start);
        let second = monitor.next_ping(start + Duration::from_secs(20));
        assert_eq!(monitor.pong_deadline(), Some(start + Duration::from_secs(10)));

        // Newer pong settles the older ping
        assert!(monitor.on_pong(&second, start + Duration::from_secs(21)));
        assert!(!monitor.is_awaiting_pong());
    }

    #[test]
    fn test_expiry() {
        let mut monitor = KeepaliveMonitor::new(&KeepaliveConfig::default());
        let start = Instant::now();
        monitor.next_ping(start);

        assert!(!monitor.is_expired(start + Duration::from_secs(9)));
        assert!(monitor.is_expired(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_unsolicited_and_malformed_pongs_ignored() {
        let mut monitor = KeepaliveMonitor::new(&KeepaliveConfig::default());
        let now = Instant::now();
        assert!(!monitor.on_pong(&0u64.to_be_bytes(), now));

        monitor.next_ping(now);
        assert!(!monitor.on_pong(b"hello", now));
        assert!(!monitor.on_pong(&7u64.to_be_bytes(), now));
        assert!(monitor.is_awaiting_pong());
    }

    #[test]
    fn test_unrepresentable_timeout_never_expires() {
        let config = KeepaliveConfig {
            ping_timeout: Some(Duration::MAX),
            ..Default::default()
        };
        let mut monitor = KeepaliveMonitor::new(&config);
        let start = Instant::now();
        monitor.next_ping(start);

        assert_eq!(monitor.pong_deadline(), None);
        assert!(!monitor.is_expired(start + Duration::from_secs(3600)));
    }

    #[test]
    fn test_no_timeout_never_expires() {
        let config = KeepaliveConfig {
            ping_timeout: None,
            ..Default::default()
        };
        let mut monitor = KeepaliveMonitor::new(&config);
        let start = Instant::now();
        monitor.next_ping(start);

        assert_eq!(monitor.pong_deadline(), None);
        assert!(!monitor.is_expired(start + Duration::from_secs(3600)));
    }
}
