use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, timeout, Duration};
use uuid::Uuid;

use crate::{
    api::{extract_user_from_token, AppState},
    constants::{WS_CLIENT_TIMEOUT_SECS, WS_HEARTBEAT_INTERVAL_SECS},
    db::Store,
    services::event_bus::DomainEvent,
};

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
    /// Comma separated battle ids to watch from the start.
    pub battles: Option<String>,
}

/// Messages a client may send to change which battle rooms it watches.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientCommand {
    Watch { battle_id: Uuid },
    Unwatch { battle_id: Uuid },
}

fn connected_payload(user_id: Option<Uuid>) -> String {
    serde_json::json!({
        "type": "connected",
        "message": "Connected to event stream",
        "user_id": user_id,
    })
    .to_string()
}

fn event_payload(event: &DomainEvent) -> String {
    serde_json::json!({
        "type": "event",
        "event": event.name,
        "data": event.payload,
    })
    .to_string()
}

fn parse_rooms(raw: Option<&str>) -> Vec<Uuid> {
    raw.unwrap_or_default()
        .split(',')
        .filter_map(|s| Uuid::parse_str(s.trim()).ok())
        .collect()
}

fn apply_command(rooms: &mut Vec<Uuid>, command: ClientCommand) {
    match command {
        ClientCommand::Watch { battle_id } => {
            if !rooms.contains(&battle_id) {
                rooms.push(battle_id);
            }
        }
        ClientCommand::Unwatch { battle_id } => rooms.retain(|id| *id != battle_id),
    }
}

/// WebSocket handler for domain events.
///
/// Anonymous clients receive global events and the rooms they watch; a valid
/// `token` additionally delivers events addressed to that user.
pub async fn handler<S: Store>(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState<S>>,
) -> Response {
    let user_id = query
        .token
        .as_deref()
        .and_then(|token| extract_user_from_token(token, &state.config.jwt_secret).ok());
    let rooms = parse_rooms(query.battles.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, rooms))
}

async fn handle_socket<S: Store>(
    socket: WebSocket,
    state: AppState<S>,
    user_id: Option<Uuid>,
    rooms: Vec<Uuid>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.events.subscribe();
    let rooms = Arc::new(Mutex::new(rooms));

    let _ = sender
        .send(Message::Text(connected_payload(user_id).into()))
        .await;

    let send_rooms = rooms.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let visible = match send_rooms.lock() {
                                Ok(rooms) => event.is_visible_to(user_id, &rooms),
                                Err(_) => break,
                            };
                            if !visible {
                                continue;
                            }
                            if sender.send(Message::Text(event_payload(&event).into())).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Event stream lagged, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        loop {
            let next_msg = timeout(Duration::from_secs(WS_CLIENT_TIMEOUT_SECS), receiver.next()).await;
            let msg = match next_msg {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {
                    tracing::info!("WebSocket client timeout");
                    break;
                }
            };

            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => match rooms.lock() {
                        Ok(mut rooms) => apply_command(&mut rooms, command),
                        Err(_) => break,
                    },
                    Err(_) => tracing::debug!("Ignoring message: {}", text),
                },
                Message::Close(_) => {
                    tracing::info!("Client disconnected");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::info!("Event stream closed for {:?}", user_id);
}
