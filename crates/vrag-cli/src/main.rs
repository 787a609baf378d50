use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::io::{self, Write};
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;
use vrag_core::{ChatRequest, MessageKind, RetrievalMode, SessionEvent, SessionState, StreamKind};
use vrag_session::{ChatSession, SessionConfig, SessionError};

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8001/chat/ws";
const DEFAULT_API_BASE: &str = "http://127.0.0.1:8001";
const DEFAULT_MODEL: &str = "qwen3:8b";

#[derive(Parser, Debug)]
#[command(name = "vrag-cli", about = "Interactive terminal client for the vrag chat backend")]
struct Args {
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long, default_value = "")]
    api_base: String,
    #[arg(long, default_value_t = 1)]
    conversation: i64,
    #[arg(long, default_value = "")]
    model: String,
    #[arg(long, default_value_t = false)]
    think: bool,
    #[arg(long, default_value = "none")]
    retrieval: String,
    /// Media names to attach to every request (at most 3).
    #[arg(long)]
    attach: Vec<String>,
}

#[derive(Debug)]
struct Config {
    ws_url: Url,
    api_base: String,
    conversation_id: i64,
    model_id: String,
    reasoning_enabled: bool,
    retrieval_mode: RetrievalMode,
    attachments: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let config = load_config(Args::parse())?;
    info!(
        event = "session_start",
        conversation_id = config.conversation_id,
        url = %config.ws_url
    );

    let mut session = ChatSession::open(SessionConfig {
        ws_url: config.ws_url.clone(),
        api_base: config.api_base.clone(),
        conversation_id: config.conversation_id,
    })
    .await;

    print_history(&session);

    let mut renderer = Renderer::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("stdin read failed")? else {
                    break;
                };
                handle_line(&mut session, &config, line.trim())?;
                if session.can_send() {
                    prompt()?;
                }
            }
            event = session.pump_event() => {
                let Some(event) = event else {
                    break;
                };
                renderer.render(&session, &event)?;
                if matches!(event, SessionEvent::Closed { .. } | SessionEvent::TransportError(_)) {
                    if let Some(error) = session.last_error() {
                        eprintln!("\ndisconnected: {error}");
                        eprintln!("(input disabled; restart to reconnect)");
                    }
                }
                if session.can_send() && renderer.turn_just_finished(&event) {
                    prompt()?;
                }
            }
        }
    }

    session.close();
    info!(event = "session_end", conversation_id = config.conversation_id);
    Ok(())
}

fn handle_line(session: &mut ChatSession, config: &Config, line: &str) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    let request = ChatRequest {
        conversation_id: config.conversation_id,
        text: line.to_string(),
        attachments: config.attachments.clone(),
        model_id: config.model_id.clone(),
        reasoning_enabled: config.reasoning_enabled,
        retrieval_mode: config.retrieval_mode,
    };
    match session.send(request) {
        Ok(()) => {}
        Err(SessionError::SendRejected { state }) => {
            // The gate guards this path; nothing was transmitted.
            warn!(event = "send_rejected", state = state);
            eprintln!("(cannot send right now: session is {state})");
        }
        Err(err) => {
            eprintln!("(send failed: {err})");
        }
    }
    Ok(())
}

/// Streams records to stdout as they grow: a heading when a record of a new
/// kind opens, raw chunks while it extends, a status line while the backend
/// reports progress.
#[derive(Default)]
struct Renderer {
    open_kind: Option<StreamKind>,
    status_shown: bool,
}

impl Renderer {
    fn render(&mut self, session: &ChatSession, event: &SessionEvent) -> Result<()> {
        let SessionEvent::Frame(frame) = event else {
            return Ok(());
        };
        let mut out = io::stdout();

        if let Some(kind) = frame.kind {
            self.clear_status(&mut out)?;
            if self.open_kind != Some(kind) {
                self.open_kind = Some(kind);
                let heading = match kind {
                    StreamKind::Reasoning => "\n[reasoning]\n",
                    StreamKind::Answer => "\n[answer]\n",
                };
                out.write_all(heading.as_bytes())?;
            }
            out.write_all(frame.content.as_bytes())?;
            out.flush()?;
        } else if let Some(stage) = session.visible_stage() {
            self.clear_status(&mut out)?;
            write!(out, "… {stage}")?;
            out.flush()?;
            self.status_shown = true;
        }

        if frame.done {
            self.clear_status(&mut out)?;
            self.open_kind = None;
            out.write_all(b"\n")?;
            out.flush()?;
        }
        Ok(())
    }

    fn clear_status(&mut self, out: &mut impl Write) -> Result<()> {
        if self.status_shown {
            out.write_all(b"\r\x1b[2K")?;
            self.status_shown = false;
        }
        Ok(())
    }

    fn turn_just_finished(&self, event: &SessionEvent) -> bool {
        matches!(event, SessionEvent::Frame(frame) if frame.done)
    }
}

fn print_history(session: &ChatSession) {
    for record in session.records() {
        let label = match record.kind {
            MessageKind::Text => "you",
            MessageKind::Reasoning => "reasoning",
            MessageKind::Answer => "answer",
        };
        println!("[{label}] {}", record.content);
    }
    if matches!(session.state(), SessionState::Connecting) {
        println!("(connecting…)");
    }
}

fn prompt() -> Result<()> {
    let mut out = io::stdout();
    out.write_all(b"> ")?;
    out.flush()?;
    Ok(())
}

fn load_config(args: Args) -> Result<Config> {
    let ws_url = resolve_ws_url(&args.ws_url)?;
    let api_base = resolve_api_base(&args.api_base);
    let model_id = resolve_model(&args.model);
    let retrieval_mode = RetrievalMode::from_str(&args.retrieval)
        .map_err(|err| anyhow::anyhow!("invalid --retrieval: {err}"))?;
    anyhow::ensure!(
        args.attach.len() <= vrag_core::MAX_ATTACHMENTS,
        "at most {} attachments are allowed",
        vrag_core::MAX_ATTACHMENTS
    );
    Ok(Config {
        ws_url,
        api_base,
        conversation_id: args.conversation,
        model_id,
        reasoning_enabled: args.think,
        retrieval_mode,
        attachments: args.attach,
    })
}

fn resolve_ws_url(arg: &str) -> Result<Url> {
    let raw = if !arg.trim().is_empty() {
        arg.trim().to_string()
    } else if let Ok(value) = env::var("VRAG_WS_URL") {
        value
    } else {
        DEFAULT_WS_URL.to_string()
    };
    Url::parse(&raw).with_context(|| format!("invalid websocket url: {raw}"))
}

fn resolve_api_base(arg: &str) -> String {
    if !arg.trim().is_empty() {
        return arg.trim().to_string();
    }
    env::var("VRAG_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string())
}

fn resolve_model(arg: &str) -> String {
    if !arg.trim().is_empty() {
        return arg.trim().to_string();
    }
    env::var("VRAG_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string())
}

fn init_logging() {
    let level = env::var("VRAG_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Logs go to stderr so streamed chat content owns stdout.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
