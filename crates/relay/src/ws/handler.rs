use super::protocol as ws_protocol;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::lock::{LockCommand, LockService};
use crate::metrics;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use doclock_common::protocol::ws::LockEvent;
use doclock_common::types::Actor;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ACCOUNT_ID_HEADER: &str = "x-account-id";
pub const WORKSPACE_ID_HEADER: &str = "x-workspace-id";
pub const DISPLAY_NAME_HEADER: &str = "x-display-name";

const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const MAX_FRAME_BYTES: usize = 16_384;

pub fn router(service: LockService) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(service)
}

/// Gateway-supplied identity without a connection yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayIdentity {
    pub account_id: Uuid,
    pub workspace_id: Uuid,
    pub display_name: String,
}

impl GatewayIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, RelayError> {
        let account_id = uuid_header(headers, ACCOUNT_ID_HEADER)?;
        let workspace_id = uuid_header(headers, WORKSPACE_ID_HEADER)?;
        let display_name = headers
            .get(DISPLAY_NAME_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| missing_identity(DISPLAY_NAME_HEADER))?
            .to_string();

        Ok(Self { account_id, workspace_id, display_name })
    }

    pub fn connect(self) -> Actor {
        Actor {
            account_id: self.account_id,
            connection_id: Uuid::new_v4(),
            display_name: self.display_name,
            workspace_id: self.workspace_id,
        }
    }
}

fn uuid_header(headers: &HeaderMap, name: &'static str) -> Result<Uuid, RelayError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .ok_or_else(|| missing_identity(name))
}

fn missing_identity(header: &'static str) -> RelayError {
    RelayError::new(ErrorCode::AuthRequired, format!("missing or invalid {header} header"))
}

pub async fn ws_upgrade(
    State(service): State<LockService>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = match GatewayIdentity::from_headers(&headers) {
        Ok(identity) => identity,
        Err(error) => return error.into_response(),
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(service, identity.connect(), socket))
            .await;
    })
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
                .into(),
        })))
        .await;
}

async fn handle_socket(service: LockService, actor: Actor, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let registry = service.registry().clone();

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<LockEvent>();
    registry.register(actor.clone(), outbound_sender).await;
    metrics::set_active_connections(registry.connection_count().await as u64);
    info!(
        connection_id = %actor.connection_id,
        account_id = %actor.account_id,
        request_id = %request_id,
        "lock connection opened"
    );

    // Server pings every HEARTBEAT_INTERVAL_MS and drops the socket when no
    // pong arrived within HEARTBEAT_TIMEOUT_MS of the last ping.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut last_pong = Instant::now();
    let mut ping_sent_at: Option<Instant> = None;

    loop {
        let pong_deadline = ping_sent_at.map(|sent_at| sent_at + heartbeat_timeout);
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                ping_sent_at.get_or_insert_with(Instant::now);
            }
            _ = sleep_until_deadline(pong_deadline) => {
                warn!(
                    connection_id = %actor.connection_id,
                    request_id = %request_id,
                    silent_for_ms = last_pong.elapsed().as_millis() as u64,
                    "heartbeat timeout, disconnecting"
                );
                break;
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if ws_protocol::send_lock_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        match ws_protocol::decode_message(&raw_message) {
                            Ok(inbound) => {
                                service.dispatch(&actor, LockCommand::from(inbound)).await;
                            }
                            Err(error) => {
                                debug!(
                                    connection_id = %actor.connection_id,
                                    error = %error,
                                    "rejecting malformed lock frame"
                                );
                                let event = LockEvent::error(
                                    None,
                                    ws_protocol::invalid_frame_message(&error),
                                );
                                if ws_protocol::send_lock_event(&mut socket, &event)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                        ping_sent_at = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        debug!(
                            connection_id = %actor.connection_id,
                            ?error,
                            "websocket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    // Stop delivering to this socket before the coordinator releases its
    // locks, so the departing connection is not sent its own lock:lost.
    registry.unregister(actor.connection_id).await;
    metrics::set_active_connections(registry.connection_count().await as u64);
    service.dispatch(&actor, LockCommand::Disconnect).await;
    info!(
        connection_id = %actor.connection_id,
        account_id = %actor.account_id,
        request_id = %request_id,
        "lock connection closed"
    );
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn identity_headers(account_id: Uuid, workspace_id: Uuid) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCOUNT_ID_HEADER,
            HeaderValue::from_str(&account_id.to_string()).expect("valid header"),
        );
        headers.insert(
            WORKSPACE_ID_HEADER,
            HeaderValue::from_str(&workspace_id.to_string()).expect("valid header"),
        );
        headers.insert(DISPLAY_NAME_HEADER, HeaderValue::from_static("  Ada  "));
        headers
    }

    #[test]
    fn identity_is_read_from_gateway_headers() {
        let account_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();

        let identity = GatewayIdentity::from_headers(&identity_headers(account_id, workspace_id))
            .expect("identity should parse");

        assert_eq!(identity.account_id, account_id);
        assert_eq!(identity.workspace_id, workspace_id);
        assert_eq!(identity.display_name, "Ada");
    }

    #[test]
    fn each_connection_gets_a_fresh_id() {
        let identity = GatewayIdentity::from_headers(&identity_headers(
            Uuid::new_v4(),
            Uuid::new_v4(),
        ))
        .expect("identity should parse");

        let first = identity.clone().connect();
        let second = identity.connect();
        assert_eq!(first.account_id, second.account_id);
        assert_ne!(first.connection_id, second.connection_id);
    }

    #[test]
    fn invalid_account_header_is_rejected() {
        let mut headers = identity_headers(Uuid::new_v4(), Uuid::new_v4());
        headers.insert(ACCOUNT_ID_HEADER, HeaderValue::from_static("not-a-uuid"));

        assert!(GatewayIdentity::from_headers(&headers).is_err());
    }

    #[test]
    fn blank_display_name_is_rejected() {
        let mut headers = identity_headers(Uuid::new_v4(), Uuid::new_v4());
        headers.insert(DISPLAY_NAME_HEADER, HeaderValue::from_static("   "));

        assert!(GatewayIdentity::from_headers(&headers).is_err());
    }
}
