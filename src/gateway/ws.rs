//! Streaming WebSocket endpoint: `GET /stream/{session_id}?flavor=alpaca`.
//! Registers the connection with the Fanout, forwards its outbox to the
//! socket, and translates inbound subscribe messages (spec §6 "WebSocket
//! stream flavor").

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::core_types::{ApiFlavor, SessionId, SubscriptionKind, SubscriptionTarget, Symbol};

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub flavor: Option<ApiFlavor>,
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let flavor = query.flavor.unwrap_or(ApiFlavor::Generic);
    ws.on_upgrade(move |socket| handle_socket(state, session_id, flavor, socket))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum InboundMessage {
    Subscribe { kind: SubscriptionKind, symbol: Option<String> },
}

async fn handle_socket(state: Arc<AppState>, session_id: SessionId, flavor: ApiFlavor, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn_id = state.fanout.register(session_id, flavor, tx);

    let forward = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(InboundMessage::Subscribe { kind, symbol }) = serde_json::from_str(&text) else {
            continue;
        };
        let target = match symbol {
            Some(s) if s != "*" => SubscriptionTarget::Symbol(Symbol::new(s)),
            _ => SubscriptionTarget::All,
        };
        state.fanout.subscribe(conn_id, kind, target);
    }

    forward.abort();
    state.fanout.unregister(conn_id);
}
