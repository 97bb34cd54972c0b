//! Test doubles for the connection manager
//!
//! - `MockOpener` / `MockHandle`: scripted transport that records every open
//! - `LogCapture`: tracing layer collecting events for level assertions
//!
//! Install `LogCapture` with `set_default` inside `#[tokio::test]` (current
//! thread runtime) so every event of the test lands in the capture.

use crate::ws::connection::{OpenError, OpenRequest, TransportHandle, TransportOpener};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Handle produced by `MockOpener`
#[derive(Debug)]
pub struct MockHandle {
    open: Arc<AtomicBool>,
    pub request: OpenRequest,
}

impl TransportHandle for MockHandle {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Scripted opener: succeeds unless a failure was queued
#[derive(Debug, Default)]
pub struct MockOpener {
    script: Mutex<VecDeque<OpenError>>,
    requests: Mutex<Vec<OpenRequest>>,
    live: Mutex<Vec<Arc<AtomicBool>>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next open with `err`
    pub fn fail_next(&self, err: OpenError) {
        self.script.lock().push_back(err);
    }

    /// Every request passed to `open`, in order
    pub fn requests(&self) -> Vec<OpenRequest> {
        self.requests.lock().clone()
    }

    pub fn open_calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Simulate the peer dropping every handle handed out so far
    pub fn drop_all(&self) {
        for open in self.live.lock().iter() {
            open.store(false, Ordering::Release);
        }
    }
}

impl TransportOpener for MockOpener {
    type Handle = MockHandle;

    async fn open(&self, request: &OpenRequest) -> Result<MockHandle, OpenError> {
        self.requests.lock().push(request.clone());

        let scripted = self.script.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        let open = Arc::new(AtomicBool::new(true));
        self.live.lock().push(Arc::clone(&open));
        Ok(MockHandle {
            open,
            request: request.clone(),
        })
    }
}

/// One captured tracing event
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Tracing layer that records every event
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route this thread's events into the capture until the guard drops
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::set_default(subscriber)
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    pub fn at_level(&self, level: Level) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.level == level)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        self.events.lock().push(CapturedEvent {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push((field.name().to_string(), format!("{:?}", value)));
        }
    }
}
