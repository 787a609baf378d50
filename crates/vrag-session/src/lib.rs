//! Session connection layer: one live duplex channel per open conversation,
//! a single-consumer event pump over the pure engine in `vrag-core`, and the
//! send gate that keeps at most one request outstanding.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;
use vrag_core::{
    ChatRequest, MessageRecord, RequestError, SessionEngine, SessionEvent, SessionState,
    StatusProjection,
};

mod history;
mod socket;

pub use history::{fetch_history, HistoryError};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Websocket endpoint of the chat backend, e.g. `ws://127.0.0.1:8001/chat/ws`.
    pub ws_url: Url,
    /// HTTP base of the history service, e.g. `http://127.0.0.1:8001`.
    pub api_base: String,
    pub conversation_id: i64,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("send rejected while {state}")]
    SendRejected { state: &'static str },
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
    #[error("request encode failed: {0}")]
    Encode(String),
    #[error("connection is gone")]
    ConnectionGone,
}

/// Exclusively-owned handle for one open conversation. All engine mutation
/// happens on the owner's task: the connection task only performs socket
/// I/O and forwards typed events through the channel drained here.
pub struct ChatSession {
    config: SessionConfig,
    engine: SessionEngine,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::UnboundedSender<String>,
    connection: JoinHandle<()>,
}

impl ChatSession {
    /// Opens a session: seeds the transcript from history (failure means an
    /// empty conversation, not an error) and spawns the connection task.
    pub async fn open(config: SessionConfig) -> Self {
        let mut engine = SessionEngine::new();
        match history::fetch_history(&config.api_base, config.conversation_id).await {
            Ok(messages) => {
                let fetched = messages.len();
                let seeded = engine.seed_history(messages);
                if seeded < fetched {
                    warn!(
                        event = "history_roles_skipped",
                        conversation_id = config.conversation_id,
                        skipped = fetched - seeded
                    );
                }
                info!(
                    event = "history_seeded",
                    conversation_id = config.conversation_id,
                    records = seeded
                );
            }
            Err(err) => {
                warn!(
                    event = "history_fetch_failed",
                    conversation_id = config.conversation_id,
                    error = %err
                );
            }
        }

        let (events, outbound, connection) = spawn_connection(&config);
        Self {
            config,
            engine,
            events,
            outbound,
            connection,
        }
    }

    /// Close-before-open: tears down the current connection task and starts
    /// a new one over the same transcript. Never leaves two live channels.
    pub fn reopen(&mut self) {
        self.connection.abort();
        let (events, outbound, connection) = spawn_connection(&self.config);
        self.events = events;
        self.outbound = outbound;
        self.connection = connection;
        self.engine.begin_connect();
        info!(
            event = "session_reopen",
            conversation_id = self.config.conversation_id
        );
    }

    /// Accepts one outbound request. Rejected without side effects unless
    /// the session is idle; on success the gate closes until the terminator
    /// arrives or the connection drops.
    pub fn send(&mut self, request: ChatRequest) -> Result<(), SessionError> {
        if !self.engine.can_send() {
            return Err(SessionError::SendRejected {
                state: self.engine.state().as_str(),
            });
        }
        request.validate()?;
        let frame =
            serde_json::to_string(&request).map_err(|err| SessionError::Encode(err.to_string()))?;
        self.outbound
            .send(frame)
            .map_err(|_| SessionError::ConnectionGone)?;
        self.engine.begin_request(&request.text);
        info!(
            event = "request_sent",
            conversation_id = request.conversation_id,
            model = %request.model_id,
            attachments = request.attachments.len()
        );
        Ok(())
    }

    /// Awaits the next connection event and folds it into the engine.
    /// Returns `None` once the connection task is gone and its queue is
    /// drained.
    pub async fn pump_event(&mut self) -> Option<SessionEvent> {
        let event = self.events.recv().await?;
        self.engine.apply(event.clone());
        Some(event)
    }

    /// Folds everything currently queued without waiting.
    pub fn drain_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.engine.apply(event);
            applied += 1;
        }
        applied
    }

    pub fn state(&self) -> &SessionState {
        self.engine.state()
    }

    pub fn can_send(&self) -> bool {
        self.engine.can_send()
    }

    pub fn records(&self) -> &[MessageRecord] {
        self.engine.records()
    }

    pub fn status(&self) -> &StatusProjection {
        self.engine.status()
    }

    pub fn visible_stage(&self) -> Option<&str> {
        self.engine.visible_stage()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.engine.last_error()
    }

    pub fn conversation_id(&self) -> i64 {
        self.config.conversation_id
    }

    /// Explicit teardown. Dropping the session has the same effect; this
    /// exists for call sites that want the handover to read as a close.
    pub fn close(self) {
        info!(
            event = "session_close",
            conversation_id = self.config.conversation_id
        );
    }
}

impl Drop for ChatSession {
    // Guaranteed teardown on every exit path: the aborted task drops the
    // socket, which closes the channel.
    fn drop(&mut self) {
        self.connection.abort();
    }
}

type ConnectionHandles = (
    mpsc::UnboundedReceiver<SessionEvent>,
    mpsc::UnboundedSender<String>,
    JoinHandle<()>,
);

fn spawn_connection(config: &SessionConfig) -> ConnectionHandles {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let connection = tokio::spawn(socket::run(config.ws_url.clone(), event_tx, outbound_rx));
    (event_rx, outbound_tx, connection)
}
