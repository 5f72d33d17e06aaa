use crate::rpc::{RpcHandler, RpcRequest, Transport};
use crate::snapshot_cache::SnapshotCache;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Source name assumed for a client until it sends a request of its own.
pub const DEFAULT_CLIENT_SRC: &str = "user_1";
/// A client that cannot take a frame within this window is dropped.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected WebSocket clients and the `src` each one last identified as.
#[derive(Default)]
pub struct ClientRegistry {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, String>>,
}

impl ClientRegistry {
    fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(id, DEFAULT_CLIENT_SRC.to_string());
        }
        id
    }

    fn set_src(&self, id: u64, src: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            if let Some(entry) = clients.get_mut(&id) {
                *entry = src.to_string();
            }
        }
    }

    fn src(&self, id: u64) -> String {
        self.clients
            .lock()
            .ok()
            .and_then(|clients| clients.get(&id).cloned())
            .unwrap_or_else(|| DEFAULT_CLIENT_SRC.to_string())
    }

    fn remove(&self, id: u64) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|clients| clients.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PushState {
    handler: RpcHandler,
    cache: SnapshotCache,
    clients: Arc<ClientRegistry>,
    shutdown: watch::Receiver<bool>,
}

/// Pushes a `NotifyStatus` frame to every connected client after each
/// publish and answers RPC requests sent over the same socket.
#[derive(Clone)]
pub struct PushNotifier {
    handler: RpcHandler,
    cache: SnapshotCache,
    clients: Arc<ClientRegistry>,
}

impl PushNotifier {
    pub fn new(handler: RpcHandler, cache: SnapshotCache) -> Self {
        Self {
            handler,
            cache,
            clients: Arc::new(ClientRegistry::default()),
        }
    }

    pub fn clients(&self) -> Arc<ClientRegistry> {
        self.clients.clone()
    }

    fn router(&self, shutdown: watch::Receiver<bool>) -> Router {
        let state = Arc::new(PushState {
            handler: self.handler.clone(),
            cache: self.cache.clone(),
            clients: self.clients.clone(),
            shutdown,
        });
        Router::new()
            .route("/rpc", get(upgrade_handler))
            .with_state(state)
    }

    /// Serves `/rpc` on `listener` until `shutdown` fires. Open client
    /// sockets are closed on shutdown as well.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "WebSocket server listening");
        let app = self.router(shutdown.clone());
        let mut stop = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.changed().await;
            })
            .await?;
        info!("WebSocket server stopped");
        Ok(())
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<PushState>>,
) -> axum::response::Response {
    ws.on_upgrade(|socket| client_loop(socket, state))
}

type ClientSink = SplitSink<WebSocket, Message>;

async fn send_frame(sink: &mut ClientSink, text: String) -> bool {
    match tokio::time::timeout(SEND_TIMEOUT, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "WebSocket send failed");
            false
        }
        Err(_) => {
            warn!("WebSocket send timed out");
            false
        }
    }
}

async fn client_loop(socket: WebSocket, state: Arc<PushState>) {
    // Subscribed before the socket is first polled
    let mut updates = state.cache.subscribe();
    let mut shutdown = state.shutdown.clone();
    let client_id = state.clients.register();
    info!(client_id, clients = state.clients.len(), "WebSocket client connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            update = updates.recv() => {
                let snapshot = match update {
                    Ok(snapshot) => snapshot,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id, skipped, "WebSocket client lagged behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let dst = state.clients.src(client_id);
                let frame = state.handler.notify_status(snapshot, &dst);
                if !send_frame(&mut sink, frame.to_string()).await {
                    break;
                }
            }
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(client_id, error = %e, "WebSocket receive failed");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => {
                        let response = match serde_json::from_str::<RpcRequest>(&text) {
                            Ok(request) => {
                                if let Some(src) = request.src.as_deref() {
                                    state.clients.set_src(client_id, src);
                                }
                                let dst = state.clients.src(client_id);
                                debug!(client_id, method = %request.method, "WebSocket request");
                                state.handler.handle(&request, Transport::WebSocket, &dst)
                            }
                            Err(e) => {
                                debug!(client_id, error = %e, "Malformed WebSocket request");
                                state.handler.parse_error(&state.clients.src(client_id), &e)
                            }
                        };
                        if !send_frame(&mut sink, response.to_json()).await {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        debug!(client_id, "Ignoring binary WebSocket frame");
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.clients.remove(client_id);
    info!(client_id, clients = state.clients.len(), "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use crate::snapshot::{DeviceSnapshot, EnergyTotals, PhaseReading};
    use chrono::Utc;
    use serde_json::Value;
    use tokio_tungstenite::{connect_async, tungstenite};

    fn snapshot(power: f64) -> DeviceSnapshot {
        DeviceSnapshot::single_phase(
            PhaseReading {
                active_power: power,
                apparent_power: power.abs(),
                power_factor: 1.0,
                ..PhaseReading::idle()
            },
            EnergyTotals::default(),
            Utc::now(),
        )
    }

    async fn next_json<S>(stream: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let tungstenite::Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_notify_and_request_over_socket() {
        let (cache, mut publisher) = SnapshotCache::new();
        let identity = Arc::new(DeviceIdentity::new("", "Meter", "AABBCCDDEEFF").unwrap());
        let handler = RpcHandler::new(identity, cache.clone());
        let notifier = PushNotifier::new(handler, cache);
        let clients = notifier.clients();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(notifier.serve(listener, shutdown_rx));

        let (mut ws, _) = connect_async(format!("ws://{addr}/rpc")).await.unwrap();

        // A request round trip guarantees the client loop is subscribed
        ws.send(tungstenite::Message::Text(
            r#"{"id":3,"src":"battery","method":"Shelly.GetDeviceInfo"}"#.to_string(),
        ))
        .await
        .unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["dst"], "battery");
        assert_eq!(reply["result"]["model"], "SPEM-003CEBEU");
        assert_eq!(clients.len(), 1);

        publisher.publish(snapshot(-800.0));
        let notify = next_json(&mut ws).await;
        assert_eq!(notify["method"], "NotifyStatus");
        assert_eq!(notify["dst"], "battery");
        assert_eq!(notify["src"], "shellypro3em-ddeeff");
        assert_eq!(notify["params"]["em:0"]["total_act_power"], -800.0);

        ws.send(tungstenite::Message::Text("not json".to_string()))
            .await
            .unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["error"]["code"], -32700);
        assert!(reply["id"].is_null());
        assert_eq!(reply["dst"], "battery");

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !clients.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_each_client_gets_every_publish() {
        let (cache, mut publisher) = SnapshotCache::new();
        let identity = Arc::new(DeviceIdentity::new("", "Meter", "AABBCCDDEEFF").unwrap());
        let notifier = PushNotifier::new(RpcHandler::new(identity, cache.clone()), cache);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(notifier.serve(listener, shutdown_rx));

        let mut sockets = Vec::new();
        for _ in 0..2 {
            let (mut ws, _) = connect_async(format!("ws://{addr}/rpc")).await.unwrap();
            ws.send(tungstenite::Message::Text(
                r#"{"id":1,"method":"EM.GetCTTypes"}"#.to_string(),
            ))
            .await
            .unwrap();
            let reply = next_json(&mut ws).await;
            assert_eq!(reply["dst"], DEFAULT_CLIENT_SRC);
            sockets.push(ws);
        }

        publisher.publish(snapshot(100.0));
        publisher.publish(snapshot(200.0));
        for ws in sockets.iter_mut() {
            let first = next_json(ws).await;
            let second = next_json(ws).await;
            assert_eq!(first["params"]["em:0"]["total_act_power"], 100.0);
            assert_eq!(second["params"]["em:0"]["total_act_power"], 200.0);
        }

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
