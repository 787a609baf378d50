use crate::wire::{classify, FrameEvent, ServerFrame, StreamKind, STATUS_STAGE_KEY};
use crate::{HistoryMessage, MessageKind, MessageRecord, Transcript};
use std::collections::BTreeMap;
use std::fmt;

/// Where the session stands with respect to the channel and the send gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Idle,
    AwaitingResponse,
    Disconnected { reason: String },
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::AwaitingResponse => "awaiting_response",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed events the connection emits into the single-consumer channel the
/// engine drains. Malformed frames never appear here; they are dropped at
/// decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    Frame(ServerFrame),
    Closed { normal: bool, reason: String },
    TransportError(String),
}

/// Latest out-of-band progress payload. Held wholesale, replaced wholesale,
/// never merged into the transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusProjection {
    current: Option<BTreeMap<String, String>>,
}

impl StatusProjection {
    pub fn replace(&mut self, payload: BTreeMap<String, String>) {
        self.current = Some(payload);
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    pub fn get(&self) -> Option<&BTreeMap<String, String>> {
        self.current.as_ref()
    }

    /// The stage label, when the payload carries one. Payloads without a
    /// stage key are held but never rendered.
    pub fn stage(&self) -> Option<&str> {
        self.current
            .as_ref()
            .and_then(|payload| payload.get(STATUS_STAGE_KEY))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }
}

/// An in-flight record of one stream kind: its index in the transcript plus
/// the accumulated text, kept identical to the record content at all times.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenSlot {
    index: usize,
    buffer: String,
}

/// The session engine: a pure fold from `SessionEvent`s into transcript and
/// status mutations. All I/O lives in the connection layer; everything here
/// is synchronous and single-owner.
#[derive(Debug)]
pub struct SessionEngine {
    transcript: Transcript,
    status: StatusProjection,
    state: SessionState,
    open_reasoning: Option<OpenSlot>,
    open_answer: Option<OpenSlot>,
    last_error: Option<String>,
}

impl Default for SessionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEngine {
    pub fn new() -> Self {
        Self {
            transcript: Transcript::new(),
            status: StatusProjection::default(),
            state: SessionState::Connecting,
            open_reasoning: None,
            open_answer: None,
            last_error: None,
        }
    }

    /// Seeds the transcript from fetched history. Seeded records are frozen;
    /// no slot is ever opened for them.
    pub fn seed_history(&mut self, history: Vec<HistoryMessage>) -> usize {
        let mut seeded = 0;
        for message in history {
            if let Some(kind) = message.role.message_kind() {
                self.transcript.push(MessageRecord::new(kind, message.content));
                seeded += 1;
            }
        }
        seeded
    }

    /// True exactly when a send would be accepted.
    pub fn can_send(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// Records an accepted outgoing request: the user text enters the
    /// transcript, both open slots reset so the next delta of each kind
    /// opens a fresh record, the status projection clears, and the gate
    /// closes. Callers check `can_send` first.
    pub fn begin_request(&mut self, text: &str) {
        self.open_reasoning = None;
        self.open_answer = None;
        self.status.clear();
        self.transcript
            .push(MessageRecord::new(MessageKind::Text, text));
        self.state = SessionState::AwaitingResponse;
    }

    /// Marks a fresh connection attempt. Used by the close-before-open path;
    /// the transcript survives, the gate stays blocked until `Opened`.
    pub fn begin_connect(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// Folds one event into the engine state.
    pub fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened => {
                if matches!(
                    self.state,
                    SessionState::Connecting | SessionState::Disconnected { .. }
                ) {
                    self.state = SessionState::Idle;
                    self.last_error = None;
                }
            }
            SessionEvent::Frame(frame) => self.apply_frame(frame),
            SessionEvent::Closed { normal, reason } => {
                if !normal {
                    self.last_error = Some(reason.clone());
                }
                self.state = SessionState::Disconnected { reason };
            }
            SessionEvent::TransportError(reason) => {
                self.last_error = Some(reason.clone());
                self.state = SessionState::Disconnected { reason };
            }
        }
    }

    fn apply_frame(&mut self, frame: ServerFrame) {
        let classified = classify(frame);
        match classified.event {
            FrameEvent::Delta { kind, text } => self.apply_delta(kind, &text),
            FrameEvent::Status(payload) => self.status.replace(payload),
            FrameEvent::Tick => {}
        }
        if classified.done {
            self.finish_turn();
        }
    }

    fn apply_delta(&mut self, kind: StreamKind, text: &str) {
        let slot = match kind {
            StreamKind::Reasoning => &mut self.open_reasoning,
            StreamKind::Answer => &mut self.open_answer,
        };
        match slot {
            Some(open) => {
                open.buffer.push_str(text);
                self.transcript.extend(open.index, text);
            }
            None => {
                let record_kind = match kind {
                    StreamKind::Reasoning => MessageKind::Reasoning,
                    StreamKind::Answer => MessageKind::Answer,
                };
                let index = self.transcript.push(MessageRecord::new(record_kind, text));
                *slot = Some(OpenSlot {
                    index,
                    buffer: text.to_string(),
                });
            }
        }
    }

    /// Terminator handling, in priority order: freeze the open records,
    /// then clear the status projection, then release the gate.
    fn finish_turn(&mut self) {
        self.open_reasoning = None;
        self.open_answer = None;
        self.status.clear();
        if self.state == SessionState::AwaitingResponse {
            self.state = SessionState::Idle;
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn records(&self) -> &[MessageRecord] {
        self.transcript.records()
    }

    pub fn status(&self) -> &StatusProjection {
        &self.status
    }

    /// Stage label to display, gated on an in-flight response.
    pub fn visible_stage(&self) -> Option<&str> {
        if self.state == SessionState::AwaitingResponse {
            self.status.stage()
        } else {
            None
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HistoryRole;

    fn delta(kind: StreamKind, text: &str) -> SessionEvent {
        SessionEvent::Frame(ServerFrame {
            kind: Some(kind),
            content: text.to_string(),
            ..ServerFrame::default()
        })
    }

    fn terminator() -> SessionEvent {
        SessionEvent::Frame(ServerFrame {
            done: true,
            ..ServerFrame::default()
        })
    }

    fn status_frame(stage: &str) -> SessionEvent {
        let mut payload = BTreeMap::new();
        payload.insert(STATUS_STAGE_KEY.to_string(), stage.to_string());
        SessionEvent::Frame(ServerFrame {
            status: Some(payload),
            ..ServerFrame::default()
        })
    }

    fn idle_engine() -> SessionEngine {
        let mut engine = SessionEngine::new();
        engine.apply(SessionEvent::Opened);
        assert!(engine.can_send());
        engine
    }

    #[test]
    fn send_appends_text_record_and_closes_gate() {
        let mut engine = idle_engine();
        engine.begin_request("hello");
        assert_eq!(
            engine.records(),
            &[MessageRecord::new(MessageKind::Text, "hello")]
        );
        assert_eq!(engine.state(), &SessionState::AwaitingResponse);
        assert!(!engine.can_send());
    }

    #[test]
    fn deltas_accumulate_in_arrival_order() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        engine.apply(delta(StreamKind::Reasoning, "foo"));
        engine.apply(delta(StreamKind::Reasoning, "bar"));
        engine.apply(delta(StreamKind::Answer, "baz"));
        engine.apply(terminator());
        assert_eq!(
            engine.records(),
            &[
                MessageRecord::new(MessageKind::Text, "q"),
                MessageRecord::new(MessageKind::Reasoning, "foobar"),
                MessageRecord::new(MessageKind::Answer, "baz"),
            ]
        );
        assert_eq!(engine.state(), &SessionState::Idle);
    }

    #[test]
    fn interleaved_kinds_grow_two_records_concurrently() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        engine.apply(delta(StreamKind::Reasoning, "r1"));
        engine.apply(delta(StreamKind::Answer, "a1"));
        engine.apply(delta(StreamKind::Reasoning, "r2"));
        engine.apply(delta(StreamKind::Answer, "a2"));
        assert_eq!(
            engine.records(),
            &[
                MessageRecord::new(MessageKind::Text, "q"),
                MessageRecord::new(MessageKind::Reasoning, "r1r2"),
                MessageRecord::new(MessageKind::Answer, "a1a2"),
            ]
        );
    }

    #[test]
    fn one_open_record_per_kind_per_turn() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        for chunk in ["a", "b", "c", "d"] {
            engine.apply(delta(StreamKind::Answer, chunk));
        }
        let answers = engine
            .records()
            .iter()
            .filter(|record| record.kind == MessageKind::Answer)
            .count();
        assert_eq!(answers, 1);
        assert_eq!(engine.records().last().unwrap().content, "abcd");
    }

    #[test]
    fn new_request_opens_fresh_records_not_extensions() {
        let mut engine = idle_engine();
        engine.begin_request("first");
        engine.apply(delta(StreamKind::Answer, "one"));
        engine.apply(terminator());

        engine.begin_request("second");
        engine.apply(delta(StreamKind::Answer, "two"));
        assert_eq!(
            engine.records(),
            &[
                MessageRecord::new(MessageKind::Text, "first"),
                MessageRecord::new(MessageKind::Answer, "one"),
                MessageRecord::new(MessageKind::Text, "second"),
                MessageRecord::new(MessageKind::Answer, "two"),
            ]
        );
    }

    #[test]
    fn status_events_leave_the_transcript_untouched() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        let before = engine.records().to_vec();
        engine.apply(status_frame("retrieving_context"));
        engine.apply(status_frame("generating"));
        assert_eq!(engine.records(), before.as_slice());
        assert_eq!(engine.visible_stage(), Some("generating"));
    }

    #[test]
    fn status_is_replaced_wholesale_not_merged() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        let mut first = BTreeMap::new();
        first.insert(STATUS_STAGE_KEY.to_string(), "indexing".to_string());
        first.insert("resource".to_string(), "clip-1.mp4".to_string());
        engine.apply(SessionEvent::Frame(ServerFrame {
            status: Some(first),
            ..ServerFrame::default()
        }));
        engine.apply(status_frame("generating"));
        let payload = engine.status().get().unwrap();
        assert_eq!(payload.len(), 1);
        assert!(!payload.contains_key("resource"));
    }

    #[test]
    fn terminator_clears_status_after_freezing_records() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        engine.apply(status_frame("generating"));
        engine.apply(delta(StreamKind::Answer, "done."));
        engine.apply(terminator());
        assert!(engine.status().is_empty());
        assert_eq!(engine.visible_stage(), None);
        assert_eq!(engine.state(), &SessionState::Idle);
    }

    #[test]
    fn status_bearing_terminator_clears_its_own_payload_and_releases_the_gate() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        engine.apply(delta(StreamKind::Answer, "final"));
        let mut payload = BTreeMap::new();
        payload.insert(STATUS_STAGE_KEY.to_string(), "finalizing".to_string());
        engine.apply(SessionEvent::Frame(ServerFrame {
            status: Some(payload),
            done: true,
            ..ServerFrame::default()
        }));
        // The payload is replaced and then immediately cleared: records
        // freeze first, status clears, the gate opens.
        assert!(engine.status().is_empty());
        assert_eq!(engine.visible_stage(), None);
        assert_eq!(engine.state(), &SessionState::Idle);
        assert_eq!(engine.records().last().unwrap().content, "final");
    }

    #[test]
    fn status_without_stage_is_held_but_never_rendered() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        let mut payload = BTreeMap::new();
        payload.insert("resource".to_string(), "clip-2.mp4".to_string());
        engine.apply(SessionEvent::Frame(ServerFrame {
            status: Some(payload),
            ..ServerFrame::default()
        }));
        assert!(!engine.status().is_empty());
        assert_eq!(engine.visible_stage(), None);
    }

    #[test]
    fn final_delta_and_terminator_on_one_frame() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        engine.apply(delta(StreamKind::Answer, "almost"));
        engine.apply(SessionEvent::Frame(ServerFrame {
            kind: Some(StreamKind::Answer),
            content: " there".to_string(),
            done: true,
            ..ServerFrame::default()
        }));
        assert_eq!(engine.records().last().unwrap().content, "almost there");
        assert_eq!(engine.state(), &SessionState::Idle);
    }

    #[test]
    fn abnormal_close_surfaces_error_and_blocks_sending() {
        let mut engine = idle_engine();
        engine.begin_request("q");
        engine.apply(delta(StreamKind::Answer, "partial"));
        engine.apply(SessionEvent::Closed {
            normal: false,
            reason: "connection reset".to_string(),
        });
        assert_eq!(
            engine.state(),
            &SessionState::Disconnected {
                reason: "connection reset".to_string()
            }
        );
        assert!(!engine.can_send());
        assert_eq!(engine.last_error(), Some("connection reset"));
        // Partial accumulation stays as-is, no rollback.
        assert_eq!(engine.records().last().unwrap().content, "partial");
    }

    #[test]
    fn normal_close_reports_no_error() {
        let mut engine = idle_engine();
        engine.apply(SessionEvent::Closed {
            normal: true,
            reason: "session closed".to_string(),
        });
        assert!(engine.last_error().is_none());
        assert!(!engine.can_send());
    }

    #[test]
    fn reopen_after_disconnect_restores_the_gate() {
        let mut engine = idle_engine();
        engine.apply(SessionEvent::TransportError("socket error".to_string()));
        assert!(!engine.can_send());
        engine.apply(SessionEvent::Opened);
        assert!(engine.can_send());
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn seeded_history_maps_roles_and_skips_unknown() {
        let mut engine = SessionEngine::new();
        let seeded = engine.seed_history(vec![
            HistoryMessage {
                role: HistoryRole::User,
                content: "what is in this clip?".to_string(),
            },
            HistoryMessage {
                role: HistoryRole::Thinking,
                content: "the user asks about the clip".to_string(),
            },
            HistoryMessage {
                role: HistoryRole::Assistant,
                content: "a demo of the product".to_string(),
            },
            HistoryMessage {
                role: HistoryRole::Unknown,
                content: "dropped".to_string(),
            },
        ]);
        assert_eq!(seeded, 3);
        let kinds: Vec<_> = engine.records().iter().map(|record| record.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::Text, MessageKind::Reasoning, MessageKind::Answer]
        );
    }

    #[test]
    fn seeded_records_are_frozen_next_delta_opens_new_record() {
        let mut engine = SessionEngine::new();
        engine.seed_history(vec![HistoryMessage {
            role: HistoryRole::Assistant,
            content: "earlier answer".to_string(),
        }]);
        engine.apply(SessionEvent::Opened);
        engine.begin_request("next");
        engine.apply(delta(StreamKind::Answer, "fresh"));
        assert_eq!(engine.records().len(), 3);
        assert_eq!(engine.records()[0].content, "earlier answer");
        assert_eq!(engine.records()[2].content, "fresh");
    }
}
