use axum::extract::ws::{Message, WebSocket};
use fog_common::{
    ChannelEvent, FogPayload, FogStateSnapshot, FogSyncData, Identity, Presence, ResyncRequest,
    Role, FOG_RESYNC_EVENT, FOG_UPDATE_EVENT,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::api::{self, AppState};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// Ask for stored snapshots, optionally of one map only.
    CatchUp {
        #[serde(default)]
        map_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    PresenceState {
        peers: Vec<Presence>,
    },
    PresenceJoin {
        presence: Presence,
    },
    PresenceLeave {
        presence: Presence,
    },
    Snapshot {
        map_id: String,
        snapshot: FogStateSnapshot,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    fn to_json(&self) -> Option<String> {
        serde_json::to_string(self)
            .map_err(|e| tracing::error!("Failed to encode server message: {}", e))
            .ok()
    }
}

pub async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, identity: Identity) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to the client (hub events, catch-up and errors)
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let mut channel = state.hub.join(&session_id);
    let mut events = channel.subscribe();
    let role = if identity.is_dm { Role::Dm } else { Role::Player };
    channel.track(&identity.user_id, role);
    let own_key = channel.peer_key().to_string();
    let channel = Arc::new(channel);
    tracing::info!(
        "WebSocket {} joined session {} as {} ({:?})",
        own_key,
        session_id,
        identity.user_id,
        role
    );

    api::ensure_recorder(&state, &session_id).await;

    let peers: Vec<Presence> = channel
        .presence_state()
        .into_iter()
        .filter(|p| p.peer_key != own_key)
        .collect();
    if let Some(json) = (ServerMessage::PresenceState { peers }).to_json() {
        let _ = tx.send(json).await;
    }
    send_catch_up(&state, &session_id, None, &tx).await;

    // Task: forward hub events to the mpsc channel
    let hub_tx = tx.clone();
    let hub_key = own_key.clone();
    let hub_channel = channel.clone();
    let mut hub_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("WebSocket {} lagged, {} events skipped", hub_key, skipped);
                    // The client missed fog; have the GM resend every map.
                    if let Ok(payload) = serde_json::to_value(ResyncRequest::default()) {
                        hub_channel.broadcast(FOG_RESYNC_EVENT, payload);
                    }
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(json) = encode_event(event, &hub_key) else {
                continue;
            };
            if hub_tx.send(json).await.is_err() {
                break;
            }
        }
    });

    // Task: send messages from mpsc channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages from client
    let recv_state = state.clone();
    let recv_session = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if let Message::Text(text) = msg {
                handle_client_message(&text, &recv_state, &recv_session, &identity, &channel, &tx).await;
            }
        }
    });

    // Wait for any task to finish, then tear down the rest
    tokio::select! {
        _ = &mut hub_task => {},
        _ = &mut send_task => {},
        _ = &mut recv_task => {},
    }
    hub_task.abort();
    send_task.abort();
    recv_task.abort();
    tracing::info!("WebSocket {} left session {}", own_key, session_id);
}

/// Client-facing form of a hub event. The connection's own broadcasts and presence are not echoed.
fn encode_event(event: ChannelEvent, own_key: &str) -> Option<String> {
    let message = match event {
        ChannelEvent::Broadcast {
            event,
            payload,
            sender,
        } => {
            if sender == own_key {
                return None;
            }
            ServerMessage::Broadcast { event, payload }
        }
        ChannelEvent::Join(presence) if presence.peer_key != own_key => {
            ServerMessage::PresenceJoin { presence }
        }
        ChannelEvent::Leave(presence) if presence.peer_key != own_key => {
            ServerMessage::PresenceLeave { presence }
        }
        ChannelEvent::Join(_) | ChannelEvent::Leave(_) => return None,
    };
    message.to_json()
}

/// Vet a fog update from a client before relaying it.
///
/// Only GM connections may publish fog. The author is overwritten with the
/// connection's own user id so peers cannot impersonate each other.
fn admit_fog_update(
    payload: serde_json::Value,
    session_id: &str,
    identity: &Identity,
) -> Result<serde_json::Value, String> {
    if !identity.is_dm {
        return Err("only the GM may update fog".into());
    }
    let mut data = FogSyncData::from_json(payload).map_err(|e| e.to_string())?;
    if data.session_id != session_id {
        return Err(format!("update is for session {}", data.session_id));
    }
    if let FogPayload::Snapshot { snapshot } = &data.payload {
        snapshot.validate().map_err(|e| e.to_string())?;
    }
    data.updated_by = identity.user_id.clone();
    data.to_json().map_err(|e| e.to_string())
}

/// Normalize a resync request from a client. Any peer may ask.
fn admit_resync_request(payload: serde_json::Value) -> Result<serde_json::Value, String> {
    let request: ResyncRequest = serde_json::from_value(payload).map_err(|e| e.to_string())?;
    serde_json::to_value(request).map_err(|e| e.to_string())
}

async fn handle_client_message(
    text: &str,
    state: &AppState,
    session_id: &str,
    identity: &Identity,
    channel: &fog_common::Channel,
    sender: &mpsc::Sender<String>,
) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!("Ignoring client message: {}", e);
            return;
        }
    };

    match msg {
        ClientMessage::Broadcast { event, payload } if event == FOG_UPDATE_EVENT => {
            match admit_fog_update(payload, session_id, identity) {
                Ok(payload) => {
                    channel.broadcast(FOG_UPDATE_EVENT, payload);
                }
                Err(message) => {
                    tracing::warn!(
                        "Rejected fog update from {} in {}: {}",
                        identity.user_id,
                        session_id,
                        message
                    );
                    if let Some(json) = (ServerMessage::Error { message }).to_json() {
                        let _ = sender.send(json).await;
                    }
                }
            }
        }
        ClientMessage::Broadcast { event, payload } if event == FOG_RESYNC_EVENT => {
            match admit_resync_request(payload) {
                Ok(payload) => {
                    tracing::debug!("{} requested a fog resync in {}", identity.user_id, session_id);
                    channel.broadcast(FOG_RESYNC_EVENT, payload);
                }
                Err(e) => {
                    tracing::debug!("Ignoring resync request from {}: {}", identity.user_id, e);
                }
            }
        }
        ClientMessage::Broadcast { event, .. } => {
            tracing::debug!("Ignoring unknown event {} from {}", event, identity.user_id);
        }
        ClientMessage::CatchUp { map_id } => {
            send_catch_up(state, session_id, map_id.as_deref(), sender).await;
        }
    }
}

async fn send_catch_up(
    state: &AppState,
    session_id: &str,
    map_id: Option<&str>,
    sender: &mpsc::Sender<String>,
) {
    let snapshots = {
        let mut archive = state.archive.lock().await;
        let maps = match map_id {
            Some(map_id) => vec![map_id.to_string()],
            None => archive.list_maps(session_id).await,
        };
        let mut snapshots = Vec::new();
        for map_id in maps {
            if let Some(snapshot) = archive.get_snapshot(session_id, &map_id).await {
                snapshots.push((map_id, snapshot));
            }
        }
        snapshots
    };

    tracing::info!(
        "WebSocket catch-up: {} fog snapshots for session {}",
        snapshots.len(),
        session_id
    );

    for (map_id, snapshot) in snapshots {
        let Some(json) = (ServerMessage::Snapshot { map_id, snapshot }).to_json() else {
            continue;
        };
        if sender.send(json).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fog_common::{FogSettings, SCHEMA_VERSION};
    use serde_json::{json, Value};

    fn presence(key: &str) -> Presence {
        Presence {
            peer_key: key.into(),
            user_id: "u".into(),
            role: Role::Player,
            online_at: 0,
        }
    }

    fn fog_update(session_id: &str, by: &str) -> Value {
        FogSyncData {
            schema: SCHEMA_VERSION,
            session_id: session_id.into(),
            map_id: "m".into(),
            payload: FogPayload::Snapshot {
                snapshot: FogStateSnapshot {
                    cols: 1,
                    rows: 2,
                    cell_size: 1.0,
                    buffer: vec![2, 0],
                },
            },
            fog_settings: FogSettings::default(),
            last_updated: 42,
            updated_by: by.into(),
        }
        .to_json()
        .unwrap()
    }

    #[test]
    fn own_events_are_not_echoed() {
        let own = ChannelEvent::Broadcast {
            event: FOG_UPDATE_EVENT.into(),
            payload: json!({}),
            sender: "peer-1".into(),
        };
        assert!(encode_event(own, "peer-1").is_none());
        assert!(encode_event(ChannelEvent::Join(presence("peer-1")), "peer-1").is_none());

        let other = encode_event(ChannelEvent::Leave(presence("peer-2")), "peer-1").unwrap();
        let other: Value = serde_json::from_str(&other).unwrap();
        assert_eq!(other["type"], "presence_leave");
        assert_eq!(other["presence"]["peer_key"], "peer-2");
    }

    #[test]
    fn players_cannot_publish_fog() {
        let player = Identity::new("p1", false);
        assert!(admit_fog_update(fog_update("s", "p1"), "s", &player).is_err());
    }

    #[test]
    fn gm_updates_are_stamped_with_connection_user() {
        let gm = Identity::new("gm", true);
        let relayed = admit_fog_update(fog_update("s", "someone-else"), "s", &gm).unwrap();
        assert_eq!(relayed["updated_by"], "gm");
        assert_eq!(relayed["last_updated"], 42);

        assert!(admit_fog_update(fog_update("other", "gm"), "s", &gm).is_err());
        assert!(admit_fog_update(json!({"schema": 1}), "s", &gm).is_err());
    }

    #[test]
    fn client_messages_are_tagged() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"catch_up"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::CatchUp { map_id: None }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"broadcast","event":"fog_update","payload":{}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Broadcast { .. }));
    }

    #[test]
    fn resync_requests_are_normalized() {
        let all = admit_resync_request(json!({})).unwrap();
        assert_eq!(all, json!({}));

        let one = admit_resync_request(json!({"map_id": "cave", "extra": 1})).unwrap();
        assert_eq!(one, json!({"map_id": "cave"}));

        assert!(admit_resync_request(json!({"map_id": 7})).is_err());
    }
}
