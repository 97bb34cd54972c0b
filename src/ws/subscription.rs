//! Per-endpoint subscription registry
//!
//! Maps stream identifiers (e.g. `v1.ticker.s` + instrument) to their
//! subscription state, one map per endpoint. The connection manager resets
//! an endpoint's map before every (re)connect; the client repopulates it
//! when it resubscribes on the fresh socket.

use crate::core::EndpointType;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Default retry limit before a stream is marked failed
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Subscription request status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Request sent, waiting for confirmation
    Pending,
    /// Subscription confirmed by the venue
    Active,
    /// Gave up after repeated failures
    Failed,
    /// Unsubscribed by the client
    Cancelled,
}

/// State of one stream on one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    pub status: SubscriptionStatus,
    pub retry_count: u32,
}

impl StreamState {
    fn pending() -> Self {
        Self {
            status: SubscriptionStatus::Pending,
            retry_count: 0,
        }
    }
}

type StreamMap = HashMap<String, StreamState>;

/// Subscription state for every endpoint
///
/// Shared between the connection manager and the client via `Arc`.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<EndpointType, StreamMap>>,
    max_retries: u32,
}

impl SubscriptionRegistry {
    /// Registry with an empty entry per endpoint
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        let entries = EndpointType::ALL
            .iter()
            .map(|&endpoint| (endpoint, StreamMap::new()))
            .collect();

        Self {
            entries: RwLock::new(entries),
            max_retries,
        }
    }

    /// Replace the endpoint's entry with an empty map
    pub fn reset(&self, endpoint: EndpointType) {
        self.entries.write().insert(endpoint, StreamMap::new());
    }

    /// Register streams as pending; already known streams are left alone
    pub fn request<S: AsRef<str>>(&self, endpoint: EndpointType, streams: &[S]) {
        let mut entries = self.entries.write();
        let map = entries.entry(endpoint).or_default();
        for stream in streams {
            map.entry(stream.as_ref().to_string())
                .or_insert_with(StreamState::pending);
        }
    }

    /// Mark streams as confirmed by the venue
    pub fn confirm<S: AsRef<str>>(&self, endpoint: EndpointType, streams: &[S]) {
        let mut entries = self.entries.write();
        let Some(map) = entries.get_mut(&endpoint) else {
            return;
        };
        for stream in streams {
            if let Some(state) = map.get_mut(stream.as_ref()) {
                state.status = SubscriptionStatus::Active;
                state.retry_count = 0;
            }
        }
    }

    /// Record a failed subscribe; back to pending until the retry limit
    pub fn mark_failed(&self, endpoint: EndpointType, stream: &str) {
        let mut entries = self.entries.write();
        let Some(state) = entries
            .get_mut(&endpoint)
            .and_then(|map| map.get_mut(stream))
        else {
            return;
        };

        state.retry_count += 1;
        state.status = if state.retry_count >= self.max_retries {
            SubscriptionStatus::Failed
        } else {
            SubscriptionStatus::Pending
        };
    }

    /// Mark streams as cancelled
    pub fn cancel<S: AsRef<str>>(&self, endpoint: EndpointType, streams: &[S]) {
        let mut entries = self.entries.write();
        let Some(map) = entries.get_mut(&endpoint) else {
            return;
        };
        for stream in streams {
            if let Some(state) = map.get_mut(stream.as_ref()) {
                state.status = SubscriptionStatus::Cancelled;
            }
        }
    }

    /// Snapshot of the endpoint's entry
    pub fn streams(&self, endpoint: EndpointType) -> HashMap<String, StreamState> {
        self.entries
            .read()
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn status(&self, endpoint: EndpointType, stream: &str) -> Option<SubscriptionStatus> {
        self.entries
            .read()
            .get(&endpoint)
            .and_then(|map| map.get(stream))
            .map(|state| state.status)
    }

    pub fn is_active(&self, endpoint: EndpointType, stream: &str) -> bool {
        self.status(endpoint, stream) == Some(SubscriptionStatus::Active)
    }

    /// Streams still waiting for a (re)subscribe
    pub fn pending(&self, endpoint: EndpointType) -> Vec<String> {
        self.entries
            .read()
            .get(&endpoint)
            .map(|map| {
                map.iter()
                    .filter(|(_, state)| state.status == SubscriptionStatus::Pending)
                    .map(|(stream, _)| stream.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, endpoint: EndpointType) -> usize {
        self.entries.read().get(&endpoint).map_or(0, |map| map.len())
    }

    pub fn is_empty(&self, endpoint: EndpointType) -> bool {
        self.len(endpoint) == 0
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
