use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{ErrorMessage, ReceivedMessage, SendMessage};
use crate::relay::registry::RoomRegistry;
use crate::relay::room::RoomEvent;
use crate::ws::session::Session;

/// WebSocket handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<RoomRegistry>>,
) -> Response {
    info!("New WebSocket connection attempt");
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

async fn send_message(sender: &SharedSink, message: &SendMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap();
    sender.lock().await.send(Message::Text(text)).await
}

/// Handle one WebSocket connection for its whole lifetime.
///
/// The read loop drives the session state machine; a separate pump
/// task forwards room broadcasts. Both share the outbound sink behind
/// a mutex. The leave path runs unconditionally when the read loop
/// ends, however abruptly the transport died.
async fn handle_socket(socket: WebSocket, registry: Arc<RoomRegistry>) {
    // Unique connection ID to identify this client
    let conn_id = Uuid::new_v4();
    info!("WebSocket connection established with connection_id: {conn_id}");

    // Split the socket into sender and receiver; the sender is shared
    // between the read loop and the event pump.
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let mut session = Session::new(conn_id, registry);
    let mut pump: Option<JoinHandle<()>> = None;

    while let Some(Ok(Message::Text(msg))) = receiver.next().await {
        // Parse the incoming message as JSON
        let parsed: ReceivedMessage = match serde_json::from_str(&msg) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to parse message from connection {conn_id}: {e}");
                let _ = send_message(
                    &sender,
                    &SendMessage::Error(ErrorMessage {
                        message: "Invalid message format".to_string(),
                    }),
                )
                .await;
                continue;
            }
        };

        let reply = session.handle(parsed).await;

        // Joining a room replaces the broadcast subscription.
        if let Some(rx) = reply.subscription {
            if let Some(task) = pump.take() {
                task.abort();
            }
            pump = Some(spawn_event_pump(conn_id, rx, sender.clone()));
        }

        for message in &reply.messages {
            if send_message(&sender, message).await.is_err() {
                error!("Failed to send reply to connection {conn_id}");
                break;
            }
        }
    }

    // Transport closed: run the leave path and stop the pump.
    session.close().await;
    if let Some(task) = pump.take() {
        task.abort();
    }
    info!("WebSocket connection {conn_id} terminated");
}

/// Forward room events to this connection, dropping its own echoes.
///
/// Delivery is best-effort: a slow or dead peer only affects itself.
fn spawn_event_pump(
    conn_id: Uuid,
    mut rx: broadcast::Receiver<RoomEvent>,
    sender: SharedSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    // Skip events from this connection to prevent echo
                    if event.origin == conn_id {
                        continue;
                    }
                    if sender
                        .lock()
                        .await
                        .send(Message::Text(event.content))
                        .await
                        .is_err()
                    {
                        // Dead connection; the read loop will reap it.
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Connection {conn_id} lagged behind, dropped {n} event(s)");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
