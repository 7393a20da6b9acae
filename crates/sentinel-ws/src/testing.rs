//! In-process WebSocket server for integration tests.
//!
//! Accepts connections on an ephemeral local port, records the request
//! path of every handshake and the text frames clients send, and lets the
//! test push frames to (or drop) every connected client.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};

enum Command {
    Send(String),
    Close,
}

#[derive(Default)]
struct ServerState {
    paths: Vec<String>,
    received: Vec<String>,
    clients: Vec<mpsc::UnboundedSender<Command>>,
    connections: u32,
}

/// A mock WebSocket server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    state: Arc<Mutex<ServerState>>,
}

impl MockWsServer {
    /// Start a server on an available port.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock ws server");
        let addr = listener.local_addr().expect("mock ws local addr");
        let state = Arc::new(Mutex::new(ServerState::default()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(stream, accept_state.clone()));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            state,
        }
    }

    /// Base URL (`ws://127.0.0.1:<port>`).
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of completed handshakes.
    pub async fn connection_count(&self) -> u32 {
        self.state.lock().await.connections
    }

    /// Request path and query of every handshake, in order.
    pub async fn requested_paths(&self) -> Vec<String> {
        self.state.lock().await.paths.clone()
    }

    /// Text frames received from clients.
    pub async fn received_messages(&self) -> Vec<String> {
        self.state.lock().await.received.clone()
    }

    /// Send a text frame to every open connection. Returns the number reached.
    pub async fn send_text(&self, text: impl Into<String>) -> usize {
        let text = text.into();
        let mut state = self.state.lock().await;
        state
            .clients
            .retain(|client| client.send(Command::Send(text.clone())).is_ok());
        state.clients.len()
    }

    /// Close every open connection from the server side.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        for client in state.clients.drain(..) {
            let _ = client.send(Command::Close);
        }
    }

    /// Poll until at least `n` handshakes have completed.
    pub async fn wait_for_connections(&self, n: u32, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                if self.connection_count().await >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Shutdown the listener. Open connections are closed.
    pub async fn shutdown(self) {
        self.disconnect_all().await;
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let mut path = String::new();
    let record_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().to_string();
        Ok(resp)
    };
    let ws_stream = match accept_hdr_async(stream, record_path).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {e}");
            return;
        }
    };

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    {
        let mut state = state.lock().await;
        state.connections += 1;
        state.paths.push(path);
        state.clients.push(cmd_tx);
    }

    let (mut write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.lock().await.received.push(text);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockWsServer::start().await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(server.connection_count().await, 0);
        server.shutdown().await;
    }
}
