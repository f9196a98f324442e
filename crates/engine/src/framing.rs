//! Line framing for relaying a run over a child process's stdio.
//!
//! Outbound, each event is one line: the sentinel, a space, then the JSON
//! event. Everything else on the stream is opaque log text. Inbound, the
//! child accepts newline-delimited `{"type":"control","signal":...}` objects.

use std::{io::Write, sync::Mutex};

use stepforge_types::{ControlSignal, InboundMessage, RunEvent};
use tracing::warn;

use crate::events::EventSink;

pub const EVENT_SENTINEL: &str = "__SF_EVENT__";

/// A classified line read from a runner's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum FramedLine {
    Event(Box<RunEvent>),
    Log(String),
    /// Carried the sentinel but the payload did not parse.
    Malformed { raw: String, error: String },
}

pub fn encode_event_line(event: &RunEvent) -> Result<String, serde_json::Error> {
    Ok(format!("{EVENT_SENTINEL} {}", serde_json::to_string(event)?))
}

pub fn decode_line(line: &str) -> FramedLine {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let Some(payload) = trimmed.strip_prefix(EVENT_SENTINEL) else {
        return FramedLine::Log(trimmed.to_string());
    };
    match serde_json::from_str::<RunEvent>(payload.trim_start()) {
        Ok(event) => FramedLine::Event(Box::new(event)),
        Err(error) => FramedLine::Malformed {
            raw: trimmed.to_string(),
            error: error.to_string(),
        },
    }
}

/// Parses one inbound stdin line. Anything that is not a control message yields `None`.
pub fn parse_control_line(line: &str) -> Option<ControlSignal> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<InboundMessage>(line) {
        Ok(InboundMessage::Control { signal }) => Some(signal),
        Err(_) => None,
    }
}

/// Writes framed events to any writer, flushing after each line.
pub struct FramedEventSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> FramedEventSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> EventSink for FramedEventSink<W> {
    fn emit(&self, event: RunEvent) {
        let line = match encode_event_line(&event) {
            Ok(line) => line,
            Err(error) => {
                warn!(event = event.type_name(), error = %error, "failed to encode run event");
                return;
            }
        };
        let mut writer = self.writer.lock().expect("framed writer lock poisoned");
        if let Err(error) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!(event = event.type_name(), error = %error, "failed to write run event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepforge_types::RunEventPayload;

    #[test]
    fn decodes_event_lines_and_passes_logs_through() {
        let event = RunEvent::now("run-1", RunEventPayload::RunPaused { node_id: Some("root/step-0".into()) });
        let line = encode_event_line(&event).expect("encode");
        assert!(line.starts_with("__SF_EVENT__ {"));

        assert_eq!(decode_line(&format!("{line}\n")), FramedLine::Event(Box::new(event)));
        assert_eq!(decode_line("compiling assets"), FramedLine::Log("compiling assets".into()));
        assert!(matches!(decode_line("__SF_EVENT__ {oops"), FramedLine::Malformed { .. }));
    }

    #[test]
    fn parses_only_control_messages() {
        assert_eq!(
            parse_control_line(r#"{"type":"control","signal":"resume"}"#),
            Some(ControlSignal::Resume)
        );
        assert_eq!(parse_control_line(r#"{"type":"hello"}"#), None);
        assert_eq!(parse_control_line("not json"), None);
        assert_eq!(parse_control_line("   "), None);
    }

    #[test]
    fn sink_writes_one_line_per_event() {
        let sink = FramedEventSink::new(Vec::new());
        sink.emit(RunEvent::now("r", RunEventPayload::RunResumed { node_id: None }));
        sink.emit(RunEvent::now("r", RunEventPayload::RunPaused { node_id: None }));

        let written = String::from_utf8(sink.into_inner()).expect("utf8");
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| line.starts_with(EVENT_SENTINEL)));
    }
}
