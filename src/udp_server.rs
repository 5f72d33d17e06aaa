use crate::rpc::{RpcHandler, Transport, DEFAULT_DST};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 4096;

/// Answers JSON-RPC datagrams on one port. Each datagram is handled in its
/// own task so a slow reply never holds up the receive loop.
pub async fn serve(
    socket: UdpSocket,
    handler: RpcHandler,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let socket = Arc::new(socket);
    let port = socket.local_addr()?.port();
    info!(port, "UDP RPC server listening");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(port, error = %e, "UDP receive failed");
                        continue;
                    }
                };
                let request = String::from_utf8_lossy(&buf[..len]).into_owned();
                let socket = socket.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    respond(&socket, &handler, &request, peer).await;
                });
            }
            _ = shutdown.changed() => {
                info!(port, "UDP RPC server stopped");
                return Ok(());
            }
        }
    }
}

async fn respond(socket: &UdpSocket, handler: &RpcHandler, request: &str, peer: SocketAddr) {
    debug!(%peer, request, "UDP request");
    let response = handler.handle_text(request, Transport::Udp, DEFAULT_DST);
    if let Some(error) = &response.error {
        warn!(%peer, code = error.code, "Rejected UDP request");
    }
    let body = response.to_json();
    if let Err(e) = socket.send_to(body.as_bytes(), peer).await {
        warn!(%peer, error = %e, "Failed to send UDP response");
    }
}
