use serde::Deserialize;
use thiserror::Error;
use vrag_core::HistoryMessage;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("history request returned status {status}")]
    Status { status: u16 },
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<HistoryMessage>,
}

/// Fetches the stored conversation once at session start. Callers treat any
/// failure as an empty conversation.
pub async fn fetch_history(
    api_base: &str,
    conversation_id: i64,
) -> Result<Vec<HistoryMessage>, HistoryError> {
    let url = format!(
        "{}/chat/get_messages?chat_id={conversation_id}",
        api_base.trim_end_matches('/')
    );
    let response = reqwest::get(&url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(HistoryError::Status {
            status: status.as_u16(),
        });
    }
    let body: HistoryResponse = response.json().await?;
    Ok(body.messages)
}
