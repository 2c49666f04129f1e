//! Pipeline lifecycle supervision
//!
//! The supervisor owns the pipeline state machine, collects child errors into
//! a bounded ring buffer, and enforces the shutdown deadline. Parts never
//! hold a reference back to it; fatal errors travel through the event surface.

use crate::pipeline::part::{ComponentEvent, EventKind, EventListener, Part};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Maximum retained recent errors per pipeline
const MAX_RECENT_ERRORS: usize = 20;

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Declared, not yet started
    Pending,
    /// Children are coming up
    Starting,
    /// Steady-state replication
    Replicating,
    /// Administratively paused
    Paused,
    /// Stopped by a fatal child error
    Failed,
    /// Shutdown in progress
    Stopping,
    /// Shutdown complete
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Pending => "Pending",
            PipelineState::Starting => "Starting",
            PipelineState::Replicating => "Replicating",
            PipelineState::Paused => "Paused",
            PipelineState::Failed => "Failed",
            PipelineState::Stopping => "Stopping",
            PipelineState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// One recorded pipeline error
#[derive(Debug, Clone)]
pub struct PipelineError {
    /// When the error was recorded
    pub at: SystemTime,
    /// Error description
    pub message: String,
}

/// Supervises the parts and services of one pipeline
pub struct PipelineSupervisor {
    topic: String,
    state: RwLock<PipelineState>,
    errors: Mutex<VecDeque<PipelineError>>,
    children: Mutex<Vec<Arc<dyn Part>>>,
    stop_timeout: Duration,
    consecutive_failures: AtomicU32,
}

impl PipelineSupervisor {
    /// Supervisor for a pipeline topic
    pub fn new(topic: impl Into<String>, stop_timeout: Duration) -> Self {
        PipelineSupervisor {
            topic: topic.into(),
            state: RwLock::new(PipelineState::Pending),
            errors: Mutex::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
            children: Mutex::new(Vec::new()),
            stop_timeout,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Pipeline topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current state
    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    /// Register a child part for supervision
    pub fn adopt(&self, part: Arc<dyn Part>) {
        self.children.lock().push(part);
    }

    /// Attempt a state transition; illegal edges fail
    pub fn transition(&self, to: PipelineState) -> Result<()> {
        let mut state = self.state.write();
        if !transition_allowed(*state, to) {
            return Err(Error::pipeline(format!(
                "illegal transition for {}: {} -> {}",
                self.topic, *state, to
            )));
        }
        tracing::info!(topic = %self.topic, from = %*state, to = %to, "pipeline state change");
        *state = to;
        Ok(())
    }

    /// Record a non-fatal error in the ring buffer
    pub fn record_error(&self, message: impl Into<String>) {
        let mut errors = self.errors.lock();
        if errors.len() >= MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(PipelineError {
            at: SystemTime::now(),
            message: message.into(),
        });
    }

    /// Record a fatal child error and fail the pipeline
    pub fn report_fatal(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(topic = %self.topic, error = %message, "fatal pipeline error");
        self.record_error(message);
        let mut state = self.state.write();
        if matches!(*state, PipelineState::Starting | PipelineState::Replicating) {
            *state = PipelineState::Failed;
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Snapshot of recent errors, oldest first
    pub fn errors(&self) -> Vec<PipelineError> {
        self.errors.lock().iter().cloned().collect()
    }

    /// Consecutive failures since the last clean run
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Reset the failure streak after a clean run
    pub fn note_clean_run(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Whether the restart policy allows reactivation after a failure
    pub fn should_restart(&self, auto_restart: bool, max_consecutive_failures: u32) -> bool {
        auto_restart && self.consecutive_failures() < max_consecutive_failures
    }

    /// Stop all children under the shutdown deadline
    ///
    /// Children that do not stop in time are abandoned; the supervisor
    /// records and returns `StopTimeout` but still finishes the sweep.
    pub async fn stop_children(&self) -> Result<()> {
        self.transition(PipelineState::Stopping)?;
        let deadline = Instant::now() + self.stop_timeout;
        let children: Vec<Arc<dyn Part>> = self.children.lock().clone();
        let mut laggards = Vec::new();

        for child in children {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, child.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.record_error(format!("{} failed to stop: {}", child.id(), err));
                }
                Err(_) => {
                    tracing::warn!(topic = %self.topic, part = child.id(), "abandoning part that missed the stop deadline");
                    laggards.push(child.id().to_string());
                }
            }
        }

        self.transition(PipelineState::Stopped)?;
        if laggards.is_empty() {
            Ok(())
        } else {
            let err = Error::StopTimeout(format!(
                "parts did not stop within {:?}: {}",
                self.stop_timeout,
                laggards.join(", ")
            ));
            self.record_error(err.to_string());
            Err(err)
        }
    }
}

impl EventListener for PipelineSupervisor {
    fn on_event(&self, event: &ComponentEvent) {
        if event.kind != EventKind::ErrorRaised {
            return;
        }
        let message = event
            .aux
            .error
            .clone()
            .unwrap_or_else(|| "unspecified error".to_string());
        self.report_fatal(format!("{}: {}", event.part, message));
    }
}

fn transition_allowed(from: PipelineState, to: PipelineState) -> bool {
    use PipelineState::*;
    match (from, to) {
        (Pending, Starting) => true,
        (Starting, Replicating) => true,
        (Starting, Failed) => true,
        (Replicating, Failed) => true,
        (Replicating, Paused) => true,
        (Paused, Starting) => true,
        (Failed, Starting) => true,
        // stop is reachable from every live state
        (Pending | Starting | Replicating | Paused | Failed, Stopping) => true,
        (Stopping, Stopped) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::part::{EventAux, EventPublisher, PartState};
    use crate::pipeline::PipelineConfig;
    use async_trait::async_trait;

    struct SlowPart {
        publisher: EventPublisher,
        delay: Duration,
    }

    #[async_trait]
    impl Part for SlowPart {
        fn id(&self) -> &str {
            self.publisher.part_id()
        }

        fn state(&self) -> PartState {
            PartState::Running
        }

        fn publisher(&self) -> &EventPublisher {
            &self.publisher
        }

        async fn start(&self, _config: Arc<PipelineConfig>) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[test]
    fn test_legal_transitions() {
        let sup = PipelineSupervisor::new("t", Duration::from_secs(1));
        sup.transition(PipelineState::Starting).unwrap();
        sup.transition(PipelineState::Replicating).unwrap();
        sup.transition(PipelineState::Paused).unwrap();
        sup.transition(PipelineState::Starting).unwrap();
        sup.transition(PipelineState::Replicating).unwrap();
        sup.transition(PipelineState::Stopping).unwrap();
        sup.transition(PipelineState::Stopped).unwrap();
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let sup = PipelineSupervisor::new("t", Duration::from_secs(1));
        assert!(sup.transition(PipelineState::Replicating).is_err());
        assert_eq!(sup.state(), PipelineState::Pending);
    }

    #[test]
    fn test_fatal_event_fails_pipeline() {
        let sup = Arc::new(PipelineSupervisor::new("t", Duration::from_secs(1)));
        sup.transition(PipelineState::Starting).unwrap();
        sup.transition(PipelineState::Replicating).unwrap();

        let publisher = EventPublisher::new("xmem_0");
        publisher.register_listener(EventKind::ErrorRaised, sup.clone());
        publisher.raise(
            EventKind::ErrorRaised,
            None,
            EventAux {
                error: Some("socket torn".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(sup.state(), PipelineState::Failed);
        let errors = sup.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("xmem_0"));
        assert_eq!(sup.consecutive_failures(), 1);
    }

    #[test]
    fn test_error_ring_buffer_bounded() {
        let sup = PipelineSupervisor::new("t", Duration::from_secs(1));
        for i in 0..50 {
            sup.record_error(format!("err {}", i));
        }
        let errors = sup.errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert!(errors[0].message.contains("30"));
    }

    #[test]
    fn test_restart_policy() {
        let sup = PipelineSupervisor::new("t", Duration::from_secs(1));
        sup.transition(PipelineState::Starting).unwrap();
        sup.report_fatal("boom");
        assert!(sup.should_restart(true, 3));
        assert!(!sup.should_restart(false, 3));
        assert!(!sup.should_restart(true, 1));
        sup.note_clean_run();
        assert!(sup.should_restart(true, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_deadline_abandons_laggards() {
        let sup = PipelineSupervisor::new("t", Duration::from_millis(50));
        sup.transition(PipelineState::Starting).unwrap();
        sup.adopt(Arc::new(SlowPart {
            publisher: EventPublisher::new("fast"),
            delay: Duration::from_millis(1),
        }));
        sup.adopt(Arc::new(SlowPart {
            publisher: EventPublisher::new("slow"),
            delay: Duration::from_secs(60),
        }));

        let result = sup.stop_children().await;
        assert!(matches!(result, Err(Error::StopTimeout(_))));
        assert_eq!(sup.state(), PipelineState::Stopped);
        assert!(sup.errors().iter().any(|e| e.message.contains("slow")));
    }

    #[tokio::test]
    async fn test_clean_stop() {
        let sup = PipelineSupervisor::new("t", Duration::from_secs(1));
        sup.transition(PipelineState::Starting).unwrap();
        sup.adopt(Arc::new(SlowPart {
            publisher: EventPublisher::new("p"),
            delay: Duration::from_millis(1),
        }));
        sup.stop_children().await.unwrap();
        assert_eq!(sup.state(), PipelineState::Stopped);
    }
}
