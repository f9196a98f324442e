//! Event sinks.
//!
//! The executor never blocks on a consumer: every sink takes events
//! synchronously and is expected to buffer or forward them immediately.

use std::sync::{Arc, Mutex};

use stepforge_types::{RunEvent, RunEventPayload};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Consumer of run events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

impl EventSink for UnboundedSender<RunEvent> {
    fn emit(&self, event: RunEvent) {
        // A dropped receiver means nobody is listening anymore; the run keeps going.
        let _ = self.send(event);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: RunEvent) {}
}

/// Keeps every event in memory. Used by tests and by callers that want the
/// full stream after the run finishes.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<RunEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().expect("event buffer lock poisoned").clone()
    }

    /// Event type tags in emission order.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("event buffer lock poisoned")
            .iter()
            .map(RunEvent::type_name)
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: RunEvent) {
        self.events.lock().expect("event buffer lock poisoned").push(event);
    }
}

/// Stamps payloads with the run id and current time before handing them to the sink.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    run_id: String,
    sink: Arc<dyn EventSink>,
}

impl EventEmitter {
    pub(crate) fn new(run_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            run_id: run_id.into(),
            sink,
        }
    }

    pub(crate) fn emit(&self, payload: RunEventPayload) {
        let event = RunEvent::now(self.run_id.clone(), payload);
        debug!(run_id = %self.run_id, event = event.type_name(), "emitting run event");
        self.sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepforge_types::RunEventPayload;

    #[test]
    fn emitter_stamps_run_id() {
        let sink = CollectingSink::new();
        let emitter = EventEmitter::new("run-7", Arc::new(sink.clone()));
        emitter.emit(RunEventPayload::RunResumed { node_id: None });

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].run_id, "run-7");
        assert_eq!(sink.type_names(), vec!["run:resumed"]);
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_tolerates_closed_receiver() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.emit(RunEvent::now("r", RunEventPayload::RunPaused { node_id: None }));
        assert_eq!(rx.recv().await.map(|event| event.type_name()), Some("run:paused"));

        drop(rx);
        tx.emit(RunEvent::now("r", RunEventPayload::RunPaused { node_id: None }));
    }
}
