use axum::{
    extract::{ws::WebSocketUpgrade, Extension, Query},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing;
use waba_core::notify::tenant_stream_key;
use waba_core::redis::get_connection;
use waba_core::AppContext;

#[derive(Deserialize)]
pub struct WsQuery {
    tenant_id: String,
}

/// Realtime bridge: forwards the tenant's Redis stream (delivery statuses,
/// inbound messages, template reviews) to the connected client.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Extension(ctx): Extension<AppContext>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query.tenant_id, ctx))
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, tenant_id: String, ctx: AppContext) {
    tracing::info!("WebSocket connection established for tenant: {}", tenant_id);

    let (mut sender, mut receiver) = socket.split();
    let ctx_send = ctx.clone();
    let tenant_id_send = tenant_id.clone();

    // Read from the tenant's Redis stream and forward to the WebSocket
    let mut send_task = tokio::spawn(async move {
        let stream_key = tenant_stream_key(&tenant_id_send);
        let mut last_id = "$".to_string();

        loop {
            let mut redis_conn = match get_connection(&ctx_send.redis_pool).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to get Redis connection: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let result: Result<
                Vec<(String, Vec<(String, Vec<(String, String)>)>)>,
                redis::RedisError,
            > = redis::cmd("XREAD")
                .arg("BLOCK")
                .arg(1000)
                .arg("STREAMS")
                .arg(&stream_key)
                .arg(&last_id)
                .query_async(&mut redis_conn)
                .await;

            match result {
                Ok(streams) => {
                    for (_, messages) in streams {
                        for (msg_id, fields) in messages {
                            last_id = msg_id;

                            let data = fields
                                .iter()
                                .find(|(key, _)| key == "data")
                                .map(|(_, value)| value.clone());

                            if let Some(data) = data {
                                if let Err(e) = sender
                                    .send(axum::extract::ws::Message::Text(data))
                                    .await
                                {
                                    tracing::debug!("WebSocket send failed, closing: {}", e);
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) if e.kind() == redis::ErrorKind::TypeError => {
                    // No messages yet
                    continue;
                }
                Err(e) => {
                    tracing::error!("Redis stream read error: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
            }
        }
    });

    // Drain client frames; close tears the bridge down
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(axum::extract::ws::Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); }
        _ = &mut recv_task => { send_task.abort(); }
    }

    tracing::info!("WebSocket connection closed for tenant: {}", tenant_id);
}
