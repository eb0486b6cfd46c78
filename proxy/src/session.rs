//! One WebSocket subscriber session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};

use crate::hub::StreamHub;

/// Drives one subscriber until the peer goes away or the hub shuts down.
///
/// A single task owns the socket, so there is at most one outstanding write;
/// the next buffer is sent only after the previous write completed. Inbound
/// messages are read and discarded. Every exit path leaves the room.
pub async fn run(socket: WebSocket, stream_id: String, who: String, hub: Arc<StreamHub>) {
    let sub = match hub.join(&stream_id) {
        Some(sub) => sub,
        None => {
            // Unknown stream: accepted, closed, nothing pushed.
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    info!("stream[{}] client {} connected", stream_id, who);

    let (mut sender, mut receiver) = socket.split();
    'session: loop {
        tokio::select! {
            _ = sub.wait() => {
                if sub.is_closed() {
                    let _ = sender.send(Message::Close(None)).await;
                    break 'session;
                }
                while let Some(buf) = sub.try_next() {
                    if let Err(e) = sender.send(Message::Binary(buf)).await {
                        // A peer that vanished mid-write is a closed
                        // session, not a failure.
                        debug!("stream[{}] client {} write ended: {}", stream_id, who, e);
                        break 'session;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    None | Some(Ok(Message::Close(_))) => break 'session,
                    Some(Ok(_)) => {} // subscribers have nothing to say
                    Some(Err(e)) => {
                        debug!("stream[{}] client {} read ended: {}", stream_id, who, e);
                        break 'session;
                    }
                }
            }
        }
    }
    hub.leave(&sub);
    info!("stream[{}] client {} disconnected", stream_id, who);
}
