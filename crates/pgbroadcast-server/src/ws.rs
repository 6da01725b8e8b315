//! WebSocket transport for client sessions.
//!
//! Maps axum's message type onto the transport-neutral [`Frame`] and hands the
//! socket to a [`Connection`].

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{future, SinkExt, StreamExt};
use pgbroadcast_core::{Connection, ConnectionConfig, Frame, HubHandle};
use tracing::debug;

use crate::AppState;

/// WebSocket upgrade handler for subscriber connections.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.hub.clone();
    let config = state.config.connection.clone();

    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, hub, config))
}

/// Run one subscriber session over an upgraded socket.
async fn handle_socket(socket: WebSocket, hub: HubHandle, config: ConnectionConfig) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let stream = stream.map(|msg| msg.map(to_frame));

    let connection = Connection::new(hub, config);
    let id = connection.id();
    if let Err(e) = connection.serve(sink, stream).await {
        debug!(connection = %id, error = %e, "session ended with error");
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

fn to_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}
