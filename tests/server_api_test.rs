// 集成测试：采集端 HTTP 接口
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use txn_monitor::hub::{BroadcastHub, MessageKind, SubscriberState};
use txn_monitor::server::{create_router, AppState};
use txn_monitor::HubConfig;

fn create_test_state() -> AppState {
    let config = HubConfig::low_latency();
    AppState::new(Arc::new(BroadcastHub::from_config(&config)), config)
}

fn transaction_payload() -> Value {
    json!({
        "timestamp": "2024-05-01T10:00:00Z",
        "pod_name": "orders-7f9c",
        "namespace": "shop",
        "event_type": "transaction_event",
        "data": {
            "transaction_id": "tx-1",
            "start_time": "2024-05-01T09:59:59.980Z",
            "end_time": "2024-05-01T10:00:00Z",
            "status": "COMMITTED",
            "duration_ms": 20,
            "query_count": 2,
            "total_execution_time_ms": 13
        },
        "metrics": {
            "connection_pool_active": 3,
            "connection_pool_max": 10,
            "heap_usage_ratio": 0.4,
            "cpu_usage_ratio": 0.2
        }
    })
}

/// 发送请求，返回状态码和 JSON 响应体
async fn send(app: &axum::Router, method: &str, path: &str, body: String) -> (u16, Value) {
    let response = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method(method)
                .uri(path)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status().as_u16();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_ingest_broadcasts_to_subscribers() {
    let state = create_test_state();
    let mut subscriber = state.hub.register();
    let app = create_router(state.clone());

    let (status, body) = send(&app, "POST", "/api/metrics", transaction_payload().to_string()).await;
    assert_eq!(status, 202);
    assert_eq!(body["delivered"], 1);

    let message = subscriber.recv().await.unwrap();
    assert_eq!(message.kind, MessageKind::TransactionEvent);
    assert_eq!(message.payload["transaction_id"], "tx-1");
    assert_eq!(message.payload["pod_name"], "orders-7f9c");
    assert_eq!(message.payload["metrics"]["connection_pool_max"], 10);
}

#[tokio::test]
async fn test_malformed_payload_rejected() {
    let state = create_test_state();
    let subscriber = state.hub.register();
    let app = create_router(state.clone());

    let (status, body) = send(&app, "POST", "/api/metrics", "{\"event_type\": 1".to_string()).await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().is_some());

    let mut unknown = transaction_payload();
    unknown["event_type"] = json!("heartbeat");
    let (status, _) = send(&app, "POST", "/api/metrics", unknown.to_string()).await;
    assert_eq!(status, 400);

    // 订阅者不受影响
    assert!(state.hub.subscriber(subscriber.id()).is_some());
    assert_eq!(state.hub.report().rejected_payloads, 2);
    assert_eq!(state.hub.report().published, 0);
}

#[tokio::test]
async fn test_health_and_stats() {
    let state = create_test_state();
    let _subscriber = state.hub.register();
    let app = create_router(state);

    let (status, health) = send(&app, "GET", "/health", String::new()).await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "UP");
    assert_eq!(health["subscribers"], 1);

    send(&app, "POST", "/api/metrics", transaction_payload().to_string()).await;
    let (status, stats) = send(&app, "GET", "/stats", String::new()).await;
    assert_eq!(status, 200);
    assert_eq!(stats["published"], 1);
    assert_eq!(stats["deliveries"], 1);
}

fn query_payload() -> Value {
    json!({
        "timestamp": "2024-05-01T10:00:00Z",
        "event_type": "query_execution",
        "data": {
            "query_id": "q-1",
            "sql_pattern": "SELECT * FROM orders WHERE id = ?",
            "sql_type": "SELECT",
            "execution_time_ms": 5,
            "status": "SUCCESS",
            "connection_id": "conn-1",
            "thread_name": "worker-1"
        }
    })
}

/// 在随机端口上启动路由
async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// 轮询直到条件成立，超时则失败
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_websocket_pushes_frames_and_closes() {
    let state = create_test_state();
    let addr = serve(state.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    wait_until("subscriber registration", || state.hub.subscriber_count() == 1).await;
    let subscriber = state.hub.subscriber(1).unwrap();
    assert_eq!(subscriber.state(), SubscriberState::Open);

    let delivered = state
        .hub
        .ingest(query_payload().to_string().as_bytes())
        .unwrap();
    assert_eq!(delivered, 1);

    // 跳过服务端的 ping，取第一条文本帧
    let frame = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            break serde_json::from_str::<Value>(&text).unwrap();
        }
    };
    assert_eq!(frame["type"], "query_metrics");
    assert_eq!(frame["data"]["query_id"], "q-1");
    assert_eq!(frame["timestamp"], "2024-05-01T10:00:00Z");

    socket.close(None).await.unwrap();
    wait_until("subscriber removal", || state.hub.subscriber_count() == 0).await;
    wait_until("subscriber closed", || subscriber.state() == SubscriberState::Closed).await;
}

#[tokio::test]
async fn test_websocket_without_pong_is_dropped() {
    let state = create_test_state();
    let addr = serve(state.clone()).await;

    // 连接后从不读取，ping 得不到回应
    let (_socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    wait_until("subscriber registration", || state.hub.subscriber_count() == 1).await;
    let subscriber = state.hub.subscriber(1).unwrap();

    wait_until("keep-alive timeout", || state.hub.subscriber_count() == 0).await;
    wait_until("subscriber closed", || subscriber.state() == SubscriberState::Closed).await;
}
