use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;
use vrag_core::{decode_frame, ServerFrame, SessionEvent, DEFAULT_MAX_FRAME_BYTES};

/// Owns the duplex socket for one connection attempt. Emits typed events to
/// the session and pumps outbound request frames. No retry loop lives here:
/// a failed or closed connection ends the task, and reconnection only
/// happens through a fresh `ChatSession::reopen`.
pub(crate) async fn run(
    url: Url,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let (mut ws, _) = match connect_async(url.as_str()).await {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "connect_error", url = %url, error = %err);
            let _ = events.send(SessionEvent::TransportError(format!(
                "failed to connect to chat backend at {url}: {err}"
            )));
            return;
        }
    };
    debug!(event = "socket_open", url = %url);
    if events.send(SessionEvent::Opened).is_err() {
        let _ = ws.close(None).await;
        return;
    }

    loop {
        tokio::select! {
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match decode_frame::<ServerFrame>(&text, DEFAULT_MAX_FRAME_BYTES) {
                            Ok(frame) => {
                                if events.send(SessionEvent::Frame(frame)).is_err() {
                                    break;
                                }
                            }
                            // One bad frame must not end the session.
                            Err(err) => warn!(event = "malformed_frame", error = %err),
                        }
                    }
                    // tungstenite queues pong replies on read by itself.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (normal, reason) = close_reason(frame);
                        let _ = events.send(SessionEvent::Closed { normal, reason });
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "socket_error", error = %err);
                        let _ = events.send(SessionEvent::TransportError(format!(
                            "chat connection failed: {err}"
                        )));
                        break;
                    }
                    None => {
                        let _ = events.send(SessionEvent::Closed {
                            normal: false,
                            reason: "connection closed unexpectedly".to_string(),
                        });
                        break;
                    }
                }
            }
            request = outbound.recv() => {
                match request {
                    Some(text) => {
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            warn!(event = "send_error", error = %err);
                            let _ = events.send(SessionEvent::TransportError(format!(
                                "failed to transmit request: {err}"
                            )));
                            break;
                        }
                    }
                    // Session handle dropped; tear the socket down.
                    None => break,
                }
            }
        }
    }

    let _ = ws.close(None).await;
    debug!(event = "socket_closed", url = %url);
}

fn close_reason(frame: Option<CloseFrame<'_>>) -> (bool, String) {
    match frame {
        Some(frame) => {
            let normal = frame.code == CloseCode::Normal;
            let reason = if frame.reason.is_empty() {
                if normal {
                    "connection closed".to_string()
                } else {
                    format!(
                        "connection closed unexpectedly (code {})",
                        u16::from(frame.code)
                    )
                }
            } else {
                frame.reason.to_string()
            };
            (normal, reason)
        }
        None => (false, "connection closed unexpectedly".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_close_code_is_not_an_error() {
        let (normal, reason) = close_reason(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        assert!(normal);
        assert_eq!(reason, "connection closed");
    }

    #[test]
    fn abnormal_close_keeps_the_code_in_the_reason() {
        let (normal, reason) = close_reason(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "".into(),
        }));
        assert!(!normal);
        assert!(reason.contains("1011"));
    }

    #[test]
    fn close_without_frame_is_abnormal() {
        let (normal, reason) = close_reason(None);
        assert!(!normal);
        assert!(!reason.is_empty());
    }

    #[test]
    fn explicit_reason_is_passed_through() {
        let (_, reason) = close_reason(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "backend restarting".into(),
        }));
        assert_eq!(reason, "backend restarting");
    }
}
