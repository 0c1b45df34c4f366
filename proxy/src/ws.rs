//! Socket session glue: wires one WebSocket connection into a uid's actor
//! mailbox.

use std::sync::{Arc, atomic::AtomicU64};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    coordinator::{ActorMsg, Coordinator},
    protocol::{ClientMessage, ServerMessage},
};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Drive one WebSocket connection for `uid` until it closes.
///
/// Malformed-JSON and unrecognized-`type` rejections are answered directly
/// to this socket without involving the uid's actor, since they carry no
/// state the actor needs to know about; everything else is forwarded into
/// the actor's mailbox, which owns all Run state.
pub async fn handle_socket(socket: WebSocket, uid: String, coordinator: Arc<Coordinator>) {
    let socket_id = next_socket_id();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mailbox = coordinator.handle(&uid);
    let _ = mailbox.send(ActorMsg::Attach {
        socket_id,
        tx: out_tx.clone(),
    });

    let outbound = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let Ok(frame) = frame else { break };
        let text = match frame {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Unknown) => {
                let _ = out_tx.send(ServerMessage::bad_type());
            }
            Ok(message) => {
                let _ = mailbox.send(ActorMsg::Client { socket_id, message });
            }
            Err(_) => {
                let _ = out_tx.send(ServerMessage::bad_json());
            }
        }
    }

    let _ = mailbox.send(ActorMsg::Detach { socket_id });
    outbound.abort();
}
