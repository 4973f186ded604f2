//! Event fan-out to dashboards and external callers.
//!
//! Every state change of a position, opportunity or scanner is published as
//! a full snapshot. Subscribers key snapshots by entity id; a subscriber
//! that falls behind skips to the newest events instead of blocking
//! publishers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ArbError;
use crate::exchange::Venue;
use crate::position::{HedgePosition, TriangularOpportunity, TriangularPosition};
use crate::strategy::ScannerStatus;

/// Event category, serialized as the event's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Opportunity,
    Position,
    Scanner,
    Error,
}

/// Snapshot of a position of either family.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "position_type", rename_all = "lowercase")]
pub enum PositionSnapshot {
    Hedge(Box<HedgePosition>),
    Triangular(Box<TriangularPosition>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerUpdate {
    pub exchange: Venue,
    pub status: ScannerStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    /// Position or opportunity the error belongs to
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventData {
    Opportunity(Box<TriangularOpportunity>),
    Position(PositionSnapshot),
    Scanner(ScannerUpdate),
    Error(ErrorReport),
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::Opportunity(_) => EventKind::Opportunity,
            EventData::Position(_) => EventKind::Position,
            EventData::Scanner(_) => EventKind::Scanner,
            EventData::Error(_) => EventKind::Error,
        }
    }
}

/// `{type, data, timestamp}` envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: EventData,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(data: EventData) -> Self {
        Self {
            kind: data.kind(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// JSON form for transports that send text frames.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","data":"serialization failed"}"#.to_string())
    }
}

#[derive(Debug, Default)]
struct Counters {
    opportunity: AtomicU64,
    position: AtomicU64,
    scanner: AtomicU64,
    error: AtomicU64,
}

impl Counters {
    fn for_kind(&self, kind: EventKind) -> &AtomicU64 {
        match kind {
            EventKind::Opportunity => &self.opportunity,
            EventKind::Position => &self.position,
            EventKind::Scanner => &self.scanner,
            EventKind::Error => &self.error,
        }
    }
}

/// Published-event counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub opportunity: u64,
    pub position: u64,
    pub scanner: u64,
    pub error: u64,
    pub subscribers: usize,
}

/// Broadcasts events to every live subscriber.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<Event>,
    counters: Arc<Counters>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Publish one event. Returns how many subscribers it reached.
    pub fn publish(&self, data: EventData) -> usize {
        let event = Event::new(data);
        self.counters.for_kind(event.kind).fetch_add(1, Ordering::Relaxed);
        match self.tx.send(event) {
            Ok(n) => n,
            Err(e) => {
                debug!(kind = ?e.0.kind, "Event dropped: no subscribers");
                0
            }
        }
    }

    pub fn opportunity(&self, opportunity: &TriangularOpportunity) -> usize {
        self.publish(EventData::Opportunity(Box::new(opportunity.clone())))
    }

    pub fn hedge_position(&self, position: &HedgePosition) -> usize {
        self.publish(EventData::Position(PositionSnapshot::Hedge(Box::new(position.clone()))))
    }

    pub fn triangular_position(&self, position: &TriangularPosition) -> usize {
        self.publish(EventData::Position(PositionSnapshot::Triangular(Box::new(
            position.clone(),
        ))))
    }

    pub fn scanner(&self, exchange: Venue, status: ScannerStatus, error: Option<String>) -> usize {
        self.publish(EventData::Scanner(ScannerUpdate {
            exchange,
            status,
            error,
        }))
    }

    pub fn error(&self, err: &ArbError, entity_id: Option<String>) -> usize {
        self.publish(EventData::Error(ErrorReport {
            code: err.code().to_string(),
            message: err.to_string(),
            entity_id,
        }))
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            skipped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            opportunity: self.counters.opportunity.load(Ordering::Relaxed),
            position: self.counters.position.load(Ordering::Relaxed),
            scanner: self.counters.scanner.load(Ordering::Relaxed),
            error: self.counters.error.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// One subscriber connection.
#[derive(Debug)]
pub struct EventSubscriber {
    rx: broadcast::Receiver<Event>,
    skipped: u64,
}

impl EventSubscriber {
    /// Next event, or `None` once the broadcaster is gone.
    ///
    /// When this subscriber lagged, the oldest events are skipped and
    /// delivery resumes with the oldest one still buffered.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.skipped += n;
                    warn!(skipped = n, "Event subscriber lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`EventSubscriber::recv`].
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.skipped += n,
                Err(_) => return None,
            }
        }
    }

    /// Total events this subscriber missed by lagging.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
