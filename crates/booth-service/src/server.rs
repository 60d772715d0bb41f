//! Realtime WebSocket endpoint.
//!
//! Each upgraded socket is bridged into the registry: inbound text frames
//! become [`TransportEvent::Frame`], outbound [`OutboundFrame`]s are written
//! by a dedicated task, and whichever side ends first reports
//! [`TransportEvent::Closed`].

use crate::connections::{ConnectionRegistryHandle, OutboundFrame, TransportEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Router serving `/ws`, with upgrade requests traced.
pub fn realtime_router(registry: ConnectionRegistryHandle) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(registry): State<ConnectionRegistryHandle>,
) -> Response {
    ws.on_upgrade(move |socket| bridge(socket, registry))
}

async fn bridge(socket: WebSocket, registry: ConnectionRegistryHandle) {
    let (connection_id, mut frames) = match registry.open_transport().await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(target: "booth.registry", error = %e, "Failed to register transport");
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if registry
                        .transport_event(connection_id, TransportEvent::Frame(text))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                // Binary and protocol-level ping/pong carry nothing for us.
                Some(Ok(_)) => {}
            },
            _ = &mut writer => break,
        }
    }

    debug!(target: "booth.registry", connection_id = %connection_id, "Transport closed");
    let _ = registry
        .transport_event(connection_id, TransportEvent::Closed)
        .await;
    writer.abort();
}
