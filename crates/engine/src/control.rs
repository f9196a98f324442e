//! Cooperative pause/cancel.
//!
//! The engine never interrupts a body. Instead it polls a [`ControlSource`] at
//! checkpoints (top of every node, every iteration, every retry backoff, and
//! inside [`StepContext::sleep`](crate::StepContext::sleep)) and interprets the
//! answer as a [`ControlDecision`]. Cancel is sticky and always wins over pause.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use stepforge_types::{ControlSignal, ControlState, FailedStep, RunEventPayload};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info};

use crate::events::EventEmitter;

/// Marker error raised when a checkpoint observes cancel.
///
/// Bodies propagate it with `?`; the engine recognises it by downcast and never
/// retries a node that failed with it.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Default)]
#[error("Cancelled")]
pub struct Cancelled;

/// Polled source of external control directives. Must be cheap to call.
pub trait ControlSource: Send + Sync {
    fn poll_signal(&self) -> Option<ControlSignal>;
}

/// A source that never signals anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoControl;

impl ControlSource for NoControl {
    fn poll_signal(&self) -> Option<ControlSignal> {
        None
    }
}

/// Latest-value mailbox written by whoever receives external control messages.
#[derive(Debug, Default, Clone)]
pub struct ControlHandle {
    signal: Arc<Mutex<Option<ControlSignal>>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, signal: ControlSignal) {
        *self.signal.lock().expect("control lock poisoned") = Some(signal);
    }

    pub fn pause(&self) {
        self.send(ControlSignal::Pause);
    }

    pub fn resume(&self) {
        self.send(ControlSignal::Resume);
    }

    pub fn cancel(&self) {
        self.send(ControlSignal::Cancel);
    }

    pub fn clear(&self) {
        *self.signal.lock().expect("control lock poisoned") = None;
    }

    pub fn current(&self) -> Option<ControlSignal> {
        *self.signal.lock().expect("control lock poisoned")
    }
}

impl ControlSource for ControlHandle {
    fn poll_signal(&self) -> Option<ControlSignal> {
        self.current()
    }
}

impl ControlSource for watch::Receiver<Option<ControlSignal>> {
    fn poll_signal(&self) -> Option<ControlSignal> {
        *self.borrow()
    }
}

/// What a checkpoint tells the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlDecision {
    Proceed,
    Wait,
    Abort,
}

pub(crate) type ControlStateCallback = Arc<dyn Fn(&ControlState) + Send + Sync>;

/// Owns the run's [`ControlState`] and interprets polled signals.
pub(crate) struct ControlGate {
    source: Arc<dyn ControlSource>,
    emitter: EventEmitter,
    on_change: Option<ControlStateCallback>,
    poll_interval: Duration,
    state: Mutex<ControlState>,
}

impl ControlGate {
    pub(crate) fn new(
        source: Arc<dyn ControlSource>,
        emitter: EventEmitter,
        on_change: Option<ControlStateCallback>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            emitter,
            on_change,
            poll_interval,
            state: Mutex::new(ControlState::default()),
        }
    }

    /// Polls the source once and folds the answer into the control state.
    pub(crate) fn decide(&self, node_id: &str) -> ControlDecision {
        let polled = self.source.poll_signal();
        let mut transition = None;

        let (decision, changed) = {
            let mut state = self.state.lock().expect("control state lock poisoned");
            if state.signal == Some(ControlSignal::Cancel) {
                return ControlDecision::Abort;
            }

            match polled {
                Some(ControlSignal::Cancel) => {
                    state.signal = Some(ControlSignal::Cancel);
                    state.paused_at = None;
                    info!(node_id, "cancel observed");
                    (ControlDecision::Abort, Some(state.clone()))
                }
                Some(ControlSignal::Pause) if state.paused_at.is_none() => {
                    state.signal = Some(ControlSignal::Pause);
                    state.paused_at = Some(node_id.to_string());
                    info!(node_id, "run paused");
                    transition = Some(RunEventPayload::RunPaused {
                        node_id: Some(node_id.to_string()),
                    });
                    (ControlDecision::Wait, Some(state.clone()))
                }
                Some(ControlSignal::Pause) => (ControlDecision::Wait, None),
                Some(ControlSignal::Resume) | None => match state.paused_at.take() {
                    Some(paused_at) => {
                        state.signal = polled;
                        info!(node_id, paused_at = %paused_at, "run resumed");
                        transition = Some(RunEventPayload::RunResumed {
                            node_id: Some(node_id.to_string()),
                        });
                        (ControlDecision::Proceed, Some(state.clone()))
                    }
                    None => (ControlDecision::Proceed, None),
                },
            }
        };

        if let Some(payload) = transition {
            self.emitter.emit(payload);
        }
        if let Some(state) = changed {
            self.publish(state);
        }
        decision
    }

    /// Suspends while paused. Errors once cancel is observed.
    pub(crate) async fn checkpoint(&self, node_id: &str) -> Result<(), Cancelled> {
        loop {
            match self.decide(node_id) {
                ControlDecision::Proceed => return Ok(()),
                ControlDecision::Abort => return Err(Cancelled),
                ControlDecision::Wait => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    /// Pausable, cancellable wait measured against a wall-clock deadline.
    ///
    /// Time spent paused counts toward the deadline, so resuming after the
    /// deadline has passed returns without waiting again.
    pub(crate) async fn sleep(&self, node_id: &str, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        loop {
            match self.decide(node_id) {
                ControlDecision::Abort => return Err(Cancelled),
                ControlDecision::Wait => {
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                ControlDecision::Proceed => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    /// Cancel-only poll for bodies. A pending pause is left for the next
    /// checkpoint, which is where the run actually suspends.
    pub(crate) fn is_cancelled(&self, node_id: &str) -> bool {
        if self.cancel_observed() {
            return true;
        }
        if self.source.poll_signal() != Some(ControlSignal::Cancel) {
            return false;
        }
        let changed = {
            let mut state = self.state.lock().expect("control state lock poisoned");
            if state.signal == Some(ControlSignal::Cancel) {
                return true;
            }
            state.signal = Some(ControlSignal::Cancel);
            state.paused_at = None;
            info!(node_id, "cancel observed");
            state.clone()
        };
        self.publish(changed);
        true
    }

    /// True while a pause is requested or the run is suspended.
    pub(crate) fn is_paused(&self) -> bool {
        if self.cancel_observed() {
            return false;
        }
        self.source.poll_signal() == Some(ControlSignal::Pause)
            || self.state.lock().expect("control state lock poisoned").is_paused()
    }

    pub(crate) fn cancel_observed(&self) -> bool {
        self.state.lock().expect("control state lock poisoned").signal == Some(ControlSignal::Cancel)
    }

    pub(crate) fn record_failure(&self, node_id: &str, error: impl Into<String>) {
        let snapshot = {
            let mut state = self.state.lock().expect("control state lock poisoned");
            state.failed_steps.push(FailedStep {
                node_id: node_id.to_string(),
                error: error.into(),
            });
            state.clone()
        };
        self.publish(snapshot);
    }

    pub(crate) fn snapshot(&self) -> ControlState {
        self.state.lock().expect("control state lock poisoned").clone()
    }

    fn publish(&self, state: ControlState) {
        debug!(signal = ?state.signal, paused_at = ?state.paused_at, "control state changed");
        if let Some(callback) = &self.on_change {
            callback(&state);
        }
        self.emitter.emit(RunEventPayload::ControlStateChanged { state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingSink;

    fn gate(handle: &ControlHandle, sink: &CollectingSink) -> ControlGate {
        ControlGate::new(
            Arc::new(handle.clone()),
            EventEmitter::new("run", Arc::new(sink.clone())),
            None,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn cancel_wins_and_is_sticky() {
        let handle = ControlHandle::new();
        let sink = CollectingSink::new();
        let gate = gate(&handle, &sink);

        handle.pause();
        assert_eq!(gate.decide("a"), ControlDecision::Wait);
        handle.cancel();
        assert_eq!(gate.decide("a"), ControlDecision::Abort);
        handle.resume();
        assert_eq!(gate.decide("b"), ControlDecision::Abort);
        assert!(gate.snapshot().paused_at.is_none());
    }

    #[test]
    fn pause_and_resume_emit_transitions_once() {
        let handle = ControlHandle::new();
        let sink = CollectingSink::new();
        let gate = gate(&handle, &sink);

        handle.pause();
        gate.decide("a");
        gate.decide("a");
        assert_eq!(gate.snapshot().paused_at.as_deref(), Some("a"));
        handle.resume();
        assert_eq!(gate.decide("a"), ControlDecision::Proceed);

        assert_eq!(
            sink.type_names(),
            vec!["run:paused", "run:control_state", "run:resumed", "run:control_state"]
        );
    }

    #[test]
    fn cancel_poll_leaves_pending_pause_alone() {
        let handle = ControlHandle::new();
        let sink = CollectingSink::new();
        let gate = gate(&handle, &sink);

        handle.pause();
        assert!(!gate.is_cancelled("a"));
        assert!(gate.snapshot().paused_at.is_none());
        assert!(sink.type_names().is_empty());

        handle.cancel();
        assert!(gate.is_cancelled("a"));
        handle.clear();
        assert!(gate.is_cancelled("b"));
        assert_eq!(sink.type_names(), vec!["run:control_state"]);
    }

    #[test]
    fn resume_without_pause_changes_nothing() {
        let handle = ControlHandle::new();
        let sink = CollectingSink::new();
        let gate = gate(&handle, &sink);

        handle.resume();
        assert_eq!(gate.decide("a"), ControlDecision::Proceed);
        assert_eq!(gate.snapshot(), ControlState::default());
        assert!(sink.type_names().is_empty());
    }

    #[test]
    fn failures_are_published_to_callback() {
        let handle = ControlHandle::new();
        let sink = CollectingSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let gate = ControlGate::new(
            Arc::new(handle),
            EventEmitter::new("run", Arc::new(sink)),
            Some(Arc::new(move |state: &ControlState| {
                recorder.lock().expect("lock").push(state.failed_steps.len());
            })),
            Duration::from_millis(10),
        );

        gate.record_failure("root/step-1", "boom");
        assert_eq!(*seen.lock().expect("lock"), vec![1]);
        assert_eq!(gate.snapshot().failed_steps[0].node_id, "root/step-1");
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_does_not_rewait_after_pause_outlasts_deadline() {
        let handle = ControlHandle::new();
        let sink = CollectingSink::new();
        let gate = Arc::new(gate(&handle, &sink));

        let controller = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            controller.pause();
            tokio::time::sleep(Duration::from_millis(200)).await;
            controller.resume();
        });

        let started = Instant::now();
        gate.sleep("a", Duration::from_millis(200)).await.expect("not cancelled");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_aborts_on_cancel() {
        let handle = ControlHandle::new();
        let sink = CollectingSink::new();
        let gate = gate(&handle, &sink);

        let controller = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            controller.cancel();
        });

        assert_eq!(gate.sleep("a", Duration::from_secs(5)).await, Err(Cancelled));
    }

    #[test]
    fn watch_receiver_is_a_control_source() {
        let (tx, rx) = watch::channel(None);
        assert_eq!(rx.poll_signal(), None);
        tx.send(Some(ControlSignal::Pause)).expect("receiver alive");
        assert_eq!(rx.poll_signal(), Some(ControlSignal::Pause));
    }
}
