use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// A router served on an ephemeral local port, for tests that need a real
/// socket (WebSocket handshakes cannot ride `oneshot`).
pub struct TestServer {
    addr: SocketAddr,
}

impl TestServer {
    /// Serve a built [`farcall_core::Server`] on an ephemeral port.
    pub async fn spawn(server: &farcall_core::Server) -> Self {
        Self::spawn_router(server.router()).await
    }

    pub async fn spawn_router(router: Router) -> Self {
        crate::init_tracing();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener has no local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server failed");
        });
        Self { addr }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    /// Socket endpoint URL; `extra` is appended to the query verbatim.
    pub fn ws_url(&self, extra: &str) -> String {
        format!("ws://{}/?ws=1{}", self.addr, extra)
    }

    /// Open a socket session.
    pub async fn connect(&self) -> TestSocket {
        TestSocket::connect(&self.ws_url("")).await
    }

    /// Open a socket session with extra query parameters (e.g. `"&token=x"`).
    pub async fn connect_with(&self, extra: &str) -> TestSocket {
        TestSocket::connect(&self.ws_url(extra)).await
    }
}

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket test client speaking the JSON envelope protocol.
pub struct TestSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestSocket {
    pub async fn connect(url: &str) -> Self {
        let (stream, _response) = connect_async(url).await.expect("websocket handshake failed");
        Self { stream }
    }

    /// Try to connect, surfacing handshake failures.
    pub async fn try_connect(url: &str) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let (stream, _response) = connect_async(url).await?;
        Ok(Self { stream })
    }

    pub async fn send_json(&mut self, value: &serde_json::Value) {
        let text = serde_json::to_string(value).unwrap();
        self.stream
            .send(Message::text(text))
            .await
            .expect("websocket send failed");
    }

    /// Receive the next data frame as JSON, skipping keep-alive frames.
    pub async fn recv_json(&mut self) -> serde_json::Value {
        tokio::time::timeout(RECV_TIMEOUT, self.next_data())
            .await
            .expect("no frame within the receive timeout")
            .expect("socket closed while waiting for a frame")
    }

    /// Assert that no data frame arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        let outcome = tokio::time::timeout(wait, self.next_data()).await;
        assert!(outcome.is_err(), "expected silence, got {outcome:?}");
    }

    async fn next_data(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).expect("invalid JSON frame"))
                }
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        rmp_decode(&bytes).expect("invalid MessagePack frame"),
                    )
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(_) => return None,
            }
        }
    }

    /// Wait for the server's `start` frame and return the connection id.
    pub async fn expect_start(&mut self) -> i64 {
        let frame = self.recv_json().await;
        assert_eq!(frame["action"], "start", "expected a start frame: {frame}");
        frame["body"].as_i64().expect("start body is the conn id")
    }

    pub async fn subscribe(&mut self, topic: &str) {
        self.send_json(&serde_json::json!({"action": "subscribe", "name": topic}))
            .await;
    }

    pub async fn unsubscribe(&mut self, topic: &str) {
        self.send_json(&serde_json::json!({"action": "unsubscribe", "name": topic}))
            .await;
    }

    /// Send a `call` envelope carrying a batch.
    pub async fn call(&mut self, batch: serde_json::Value) {
        self.send_json(&serde_json::json!({"action": "call", "body": batch}))
            .await;
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

fn rmp_decode(bytes: &[u8]) -> Option<serde_json::Value> {
    rmp_serde::from_slice(bytes).ok()
}

/// Poll an async condition until it holds or the deadline passes.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {what}");
}
