//! `GET /api/stream`: WebSocket feed of overview snapshots.
//!
//! Each connection holds one coalescer subscription for its lifetime;
//! closing the socket drops the subscription.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use tracing::{debug, warn};

use super::AppState;
use crate::broadcast::BroadcastCoalescer;
use crate::persist::Store;
use crate::service::Overview;

pub fn router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new().route("/api/stream", get(upgrade::<S>))
}

async fn upgrade<S: Store + 'static>(ws: WebSocketUpgrade, State(state): State<AppState<S>>) -> Response {
    let coalescer = Arc::clone(&state.stream);
    ws.on_upgrade(move |socket| serve(socket, coalescer))
}

async fn serve(mut socket: WebSocket, coalescer: Arc<BroadcastCoalescer<Overview>>) {
    // ---
    let mut subscription = coalescer.subscribe();
    debug!(id = subscription.id(), "stream client connected");

    loop {
        tokio::select! {
            snapshot = subscription.recv() => {
                let Some(snapshot) = snapshot else { break };
                let text = match serde_json::to_string(&*snapshot) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "could not encode overview snapshot");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(id = subscription.id(), "stream client disconnected");
}
