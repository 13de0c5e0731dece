use axum::extract::ws::{Message, WebSocket};
use doclock_common::protocol::ws::{ClientMessage, LockEvent};

pub fn decode_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str::<ClientMessage>(raw)
}

pub fn encode_event(event: &LockEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

pub async fn send_lock_event(socket: &mut WebSocket, event: &LockEvent) -> Result<(), ()> {
    let encoded = encode_event(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Error text for a frame that is not a lock message.
pub fn invalid_frame_message(error: &serde_json::Error) -> String {
    format!("invalid lock message: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn decodes_lock_request_frames() {
        let document_id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"lock:request","document_id":"{document_id}"}}"#);

        let decoded = decode_message(&raw).expect("lock request should decode");
        assert_eq!(decoded.document_id(), document_id);
    }

    #[test]
    fn unknown_frames_produce_a_readable_error() {
        let error = decode_message(r#"{"type":"lock:grab"}"#).expect_err("unknown type rejected");
        assert!(invalid_frame_message(&error).starts_with("invalid lock message: "));
    }
}
