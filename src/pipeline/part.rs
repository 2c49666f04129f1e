//! Part/connector framework
//!
//! A pipeline is a DAG of parts (sources, sinks) linked by connectors
//! (routers). Every node is a labelled component that can be started and
//! stopped and that publishes typed events; statistics and supervision hang
//! off the event surface so the dataflow stays free of back-references.

use crate::pipeline::PipelineConfig;
use crate::protocol::MutationEvent;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Kind of a component event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A mutation entered a part
    DataReceived,
    /// A mutation was dropped by the filter
    DataFiltered,
    /// A mutation was acknowledged by the target
    DataSent,
    /// A part hit a fatal error
    ErrorRaised,
}

/// Auxiliary per-event scalars
///
/// Only the fields meaningful for the event kind are populated; the rest stay
/// at their zero values.
#[derive(Debug, Clone, Default)]
pub struct EventAux {
    /// Mutation seqno
    pub seqno: u64,
    /// Mutation vBucket
    pub vbno: u16,
    /// Replicated size in bytes
    pub size: usize,
    /// Depth of the part's queue after the event
    pub queue_len: usize,
    /// Bytes queued in the part after the event
    pub queue_bytes: usize,
    /// High-resolution timestamp of the event
    pub at: Option<Instant>,
    /// Error description for `ErrorRaised` and failed-filter drops
    pub error: Option<String>,
}

/// An event raised by a part or connector
#[derive(Debug, Clone)]
pub struct ComponentEvent {
    /// Event kind
    pub kind: EventKind,
    /// Id of the originating component
    pub part: String,
    /// The mutation the event concerns, shared by reference
    pub mutation: Option<Arc<MutationEvent>>,
    /// Auxiliary scalars
    pub aux: EventAux,
}

/// Receives component events
pub trait EventListener: Send + Sync {
    /// Handle one event; must not block the raising part
    fn on_event(&self, event: &ComponentEvent);
}

/// Per-component event registration and dispatch
pub struct EventPublisher {
    part_id: String,
    listeners: RwLock<HashMap<EventKind, Vec<Arc<dyn EventListener>>>>,
}

impl EventPublisher {
    /// Publisher for a component
    pub fn new(part_id: impl Into<String>) -> Self {
        EventPublisher {
            part_id: part_id.into(),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Id of the owning component
    pub fn part_id(&self) -> &str {
        &self.part_id
    }

    /// Subscribe a listener to one event kind
    pub fn register_listener(&self, kind: EventKind, listener: Arc<dyn EventListener>) {
        self.listeners.write().entry(kind).or_default().push(listener);
    }

    /// Raise an event to all listeners of its kind
    pub fn raise(&self, kind: EventKind, mutation: Option<Arc<MutationEvent>>, aux: EventAux) {
        let listeners = self.listeners.read();
        let Some(subscribed) = listeners.get(&kind) else {
            return;
        };
        let event = ComponentEvent {
            kind,
            part: self.part_id.clone(),
            mutation,
            aux,
        };
        for listener in subscribed {
            listener.on_event(&event);
        }
    }

    /// Raise `ErrorRaised` with an error description
    pub fn raise_error(&self, error: &crate::Error) {
        self.raise(
            EventKind::ErrorRaised,
            None,
            EventAux {
                error: Some(error.to_string()),
                at: Some(Instant::now()),
                ..Default::default()
            },
        );
    }
}

/// Lifecycle state of a part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    /// Constructed, not started
    Initial,
    /// Running
    Running,
    /// Stopped cleanly
    Stopped,
    /// Stopped by a fatal error
    Failed,
}

/// A pipeline node: source or sink
#[async_trait]
pub trait Part: Send + Sync {
    /// Component id
    fn id(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> PartState;

    /// Event surface
    fn publisher(&self) -> &EventPublisher;

    /// Start the part with an immutable settings snapshot
    async fn start(&self, config: Arc<PipelineConfig>) -> Result<()>;

    /// Stop the part, releasing its resources
    async fn stop(&self) -> Result<()>;
}

/// A connector between a source part and its downstream parts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Component id
    fn id(&self) -> &str;

    /// Event surface
    fn publisher(&self) -> &EventPublisher;

    /// Route one mutation downstream; blocks when the downstream queue is full
    async fn forward(&self, mutation: Arc<MutationEvent>) -> Result<()>;
}
