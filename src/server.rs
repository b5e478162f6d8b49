use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::HubError;
use crate::hub::{BroadcastHub, HubReport};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub config: HubConfig,
}

impl AppState {
    pub fn new(hub: Arc<BroadcastHub>, config: HubConfig) -> Self {
        Self { hub, config }
    }

    pub fn from_config(config: HubConfig) -> Self {
        Self {
            hub: Arc::new(BroadcastHub::from_config(&config)),
            config,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub subscribers: usize,
}

pub fn create_router(state: AppState) -> Router {
    use tower_http::cors::{Any, CorsLayer};

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/api/metrics", post(ingest_metrics))
        .route("/ws", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn root() -> &'static str {
    "Transaction Monitor Collector - POST /api/metrics, subscribe at /ws"
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        subscribers: state.hub.subscriber_count(),
    })
}

/// 获取广播统计
async fn get_stats(State(state): State<AppState>) -> Json<HubReport> {
    Json(state.hub.report())
}

/// 接收一条上报并广播
///
/// 直接拿原始字节自己解析，格式错误返回 400 和错误描述
async fn ingest_metrics(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), HubError> {
    let delivered = state.hub.ingest(&body).map_err(|err| {
        debug!(error = %err, "rejected inbound payload");
        err
    })?;
    Ok((StatusCode::ACCEPTED, Json(IngestResponse { delivered })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 单个订阅者的连接任务：推送消息、定时 ping、检查心跳
async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut handle = state.hub.register();
    let id = handle.id();
    let subscriber = Arc::clone(&handle.subscriber);
    let (mut sink, mut stream) = socket.split();

    let mut ping = tokio::time::interval(state.config.ping_interval);
    // 第一次 tick 立即返回
    ping.tick().await;

    loop {
        tokio::select! {
            outbound = handle.recv() => {
                let Some(message) = outbound else {
                    // 已被注销且队列取空
                    break;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(subscriber_id = id, error = %err, "failed to encode message");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(subscriber_id = id, error = %err, "subscriber write failed");
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => subscriber.touch(),
                    Some(Err(err)) => {
                        debug!(subscriber_id = id, error = %err, "subscriber read failed");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if subscriber.idle_for() > state.config.pong_timeout {
                    warn!(subscriber_id = id, "subscriber keep-alive timed out");
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // OPEN -> CLOSING，再取空队列、释放连接后进入 CLOSED
    state.hub.unregister(id);
    handle.receiver.close();
    while handle.receiver.try_recv().is_ok() {}
    let _ = sink.close().await;
    if let Err(err) = subscriber.mark_closed() {
        debug!(subscriber_id = id, error = %err, "subscriber already closed");
    }
}

pub async fn run_server(state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = state.config.bind_addr;
    let keepalive = state
        .hub
        .spawn_keepalive(state.config.ping_interval, state.config.pong_timeout);
    let app = create_router(state);

    info!(%addr, "collector listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app).await;
    keepalive.abort();
    result?;

    Ok(())
}
