//! Integration tests for the WebSocket transport

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tether_transport::{CloseEvent, Frame, FrameType, Transport, Value};
use tether_transport_ws::{ClientConfig, ClientWebSocketTransport, ServerWebSocketTransport};
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;
use uuid::Uuid;

async fn echo(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move {
        let transport = ServerWebSocketTransport::new(socket);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.on_receive(Arc::new(move |frame| {
            let _ = tx.send(frame);
        }));
        transport.start();

        let source = Uuid::new_v4();
        while let Some(frame) = rx.recv().await {
            let reply = Frame::response(frame.correlation_id, frame.payload, source);
            if transport.send(reply).await.is_err() {
                break;
            }
        }
    })
}

async fn reject(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        socket
            .send(Message::Close(Some(CloseFrame {
                code: axum::extract::ws::close_code::POLICY,
                reason: "go away".into(),
            })))
            .await
            .ok();
    })
}

/// Never reads. The first socket is dropped after a short while, later ones
/// are held open.
async fn mute(ws: WebSocketUpgrade, accepted: Arc<AtomicUsize>) -> impl IntoResponse {
    let nth = accepted.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| async move {
        let hold = if nth == 0 {
            Duration::from_millis(300)
        } else {
            Duration::from_secs(10)
        };
        tokio::time::sleep(hold).await;
        drop(socket);
    })
}

async fn serve() -> SocketAddr {
    let accepted = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/echo", get(echo))
        .route("/reject", get(reject))
        .route(
            "/mute",
            get(move |ws: WebSocketUpgrade| mute(ws, Arc::clone(&accepted))),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr, path: &str) -> ClientWebSocketTransport {
    let url = Url::parse(&format!("ws://{addr}{path}")).unwrap();
    ClientWebSocketTransport::new(url).unwrap()
}

fn collect(transport: &ClientWebSocketTransport) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.on_receive(Arc::new(move |frame| {
        let _ = tx.send(frame);
    }));
    rx
}

#[tokio::test]
async fn test_echo_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = serve().await;
    let transport = client(addr, "/echo");
    let mut received = collect(&transport);

    for i in 1..=3u64 {
        transport
            .send(Frame::send(i, Value::Text(format!("hello {i}")), Uuid::new_v4()))
            .await
            .unwrap();
    }
    assert!(transport.is_open());

    for i in 1..=3u64 {
        let frame = timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.frame_type, FrameType::Response);
        assert_eq!(frame.correlation_id, i);
        assert_eq!(frame.payload, Value::Text(format!("hello {i}")));
    }

    transport.close().await.unwrap();
    assert!(!transport.is_open());
}

#[tokio::test]
async fn test_reopens_after_close() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = serve().await;
    let transport = client(addr, "/echo");
    let mut received = collect(&transport);

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    transport.on_close(Arc::new(move |event: &CloseEvent| {
        let _ = closed_tx.send(event.clone());
    }));

    transport
        .send(Frame::send(1, Value::Text("first".to_string()), Uuid::new_v4()))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(5), received.recv()).await.unwrap();

    transport.close().await.unwrap();
    let event = timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.initiated_locally);
    assert!(!transport.is_open());

    transport
        .send(Frame::send(2, Value::Text("second".to_string()), Uuid::new_v4()))
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.correlation_id, 2);
    assert!(transport.is_open());
}

#[tokio::test]
async fn test_server_close_reports_reason() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = serve().await;
    let transport = client(addr, "/reject");

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    transport.on_close(Arc::new(move |event: &CloseEvent| {
        let _ = closed_tx.send(event.clone());
    }));

    // The write may or may not beat the close frame; either way the close is observed.
    let _ = transport
        .send(Frame::send(1, Value::Null, Uuid::new_v4()))
        .await;

    let event = timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.code, Some(1008));
    assert_eq!(event.reason, "go away");
    assert!(!event.initiated_locally);
    assert!(!transport.is_open());
}

#[tokio::test]
async fn test_close_completes_while_server_holds_transport() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = serve().await;
    let transport = client(addr, "/echo");
    let mut received = collect(&transport);

    transport
        .send(Frame::send(1, Value::Null, Uuid::new_v4()))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(5), received.recv()).await.unwrap();

    // The echo task keeps its server transport alive for good.
    let started = Instant::now();
    transport.close().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(1), "close took {elapsed:?}");
    assert!(!transport.is_open());
}

#[tokio::test]
async fn test_replaced_socket_closes_silently() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = serve().await;
    let url = Url::parse(&format!("ws://{addr}/mute")).unwrap();
    let config = ClientConfig::default().with_close_timeout(Duration::from_secs(3));
    let transport = Arc::new(ClientWebSocketTransport::with_config(url, config).unwrap());

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    transport.on_close(Arc::new(move |event: &CloseEvent| {
        let _ = closed_tx.send(event.clone());
    }));

    transport
        .send(Frame::send(1, Value::Null, Uuid::new_v4()))
        .await
        .unwrap();

    // The server never answers the close, so the first socket stays closing
    // until the server drops it.
    let closing = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.close().await })
    };
    timeout(Duration::from_secs(5), async {
        while transport.is_open() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // A send meanwhile opens a replacement socket.
    transport
        .send(Frame::send(2, Value::Null, Uuid::new_v4()))
        .await
        .unwrap();
    assert!(transport.is_open());

    closing.await.unwrap().unwrap();
    assert!(transport.is_open());
    assert!(closed_rx.try_recv().is_err());
}
