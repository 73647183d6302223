//! AIP wire encode/decode helpers layered over the plain message types in
//! `galaxy-core::device`.

use galaxy_common::error::{Error, Result};
use galaxy_core::device::{AipMessage, MessageHeader};
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub fn new_header() -> MessageHeader {
    MessageHeader {
        message_id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

pub fn encode(message: &AipMessage) -> Result<WsMessage> {
    let text = serde_json::to_string(message)?;
    Ok(WsMessage::Text(text))
}

pub fn decode(message: WsMessage) -> Result<Option<AipMessage>> {
    match message {
        WsMessage::Text(text) => {
            let parsed = serde_json::from_str(&text)?;
            Ok(Some(parsed))
        }
        WsMessage::Binary(bytes) => {
            let parsed = serde_json::from_slice(&bytes)?;
            Ok(Some(parsed))
        }
        WsMessage::Close(_) => Ok(None),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
    }
}

pub fn dispatch_message_with_timeout(
    task_id: &str,
    goal: &str,
    payload: serde_json::Value,
    timeout_ms: Option<u64>,
) -> AipMessage {
    AipMessage::Dispatch {
        header: new_header(),
        task_id: task_id.to_string(),
        goal: goal.to_string(),
        payload,
        timeout_ms,
    }
}

pub fn cancel_message(task_id: &str) -> AipMessage {
    AipMessage::Cancel {
        header: new_header(),
        task_id: task_id.to_string(),
    }
}

pub fn heartbeat_message() -> AipMessage {
    AipMessage::Heartbeat {
        header: new_header(),
        load: None,
    }
}

pub fn protocol_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Protocol(format!("{context}: {err}"))
}
