//! `/ws/{topic}`: the progress channel over a websocket, with ping/pong keepalive.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use genforge_common::ProgressEvent;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::SharedState;
use crate::channel::ProgressChannel;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before the connection counts as dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let channel = Arc::clone(state.orchestrator.channel());
    let rx = channel.subscribe(&topic);
    ws.on_upgrade(move |socket| handle_socket(socket, channel, topic, rx))
}

async fn handle_socket(
    socket: WebSocket,
    channel: Arc<ProgressChannel>,
    topic: String,
    rx: broadcast::Receiver<ProgressEvent>,
) {
    debug!(%topic, "websocket subscriber connected");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx).await;
    let released = channel.release(&topic);
    debug!(%topic, released, "websocket subscriber disconnected");
}

/// Forward channel events until the client leaves, stops answering pings, or
/// falls behind the channel.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<ProgressEvent>,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    // Set while a ping is unanswered.
    let mut ping_sent_at: Option<Instant> = None;

    loop {
        let open = tokio::select! {
            _ = ping.tick() => {
                if ping_sent_at.is_some_and(|sent| sent.elapsed() > PONG_TIMEOUT) {
                    debug!("websocket pong timeout");
                    false
                } else {
                    if ping_sent_at.is_none() {
                        ping_sent_at = Some(Instant::now());
                    }
                    sender.send(Message::Ping(Default::default())).await.is_ok()
                }
            }
            // Closing on lag sends the client back to polling the store.
            event = rx.recv() => match event {
                Ok(event) => forward(&mut sender, &event).await,
                Err(_) => false,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Pong(_))) => {
                    ping_sent_at = None;
                    true
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => false,
                Some(Ok(_)) => true,
            },
        };
        if !open {
            break;
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Send one event as a JSON text frame. False once the socket is gone.
async fn forward(sender: &mut SplitSink<WebSocket, Message>, event: &ProgressEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, event_type = %event.event_type, "failed to serialize progress event");
            true
        }
    }
}
