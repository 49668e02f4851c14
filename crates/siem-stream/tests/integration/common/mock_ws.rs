//! Mock stream server for integration tests.
//!
//! Every accepted connection receives the same scripted frames, then either
//! stays open until the server shuts down or is dropped without a closing
//! handshake.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// What happens to a connection after its frames are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterScript {
    StayOpen,
    Drop,
}

/// A mock stream server for testing.
pub struct MockStreamServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    closing: watch::Sender<bool>,
    connections: Arc<Mutex<u32>>,
}

impl MockStreamServer {
    /// Start a server on an available port that sends `frames` to every client.
    pub async fn start(frames: Vec<String>, after: AfterScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (closing, _) = watch::channel(false);

        let frames = Arc::new(frames);
        let connections_clone = connections.clone();
        let closing_clone = closing.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            frames.clone(),
                            after,
                            connections_clone.clone(),
                            closing_clone.subscribe(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            closing,
            connections,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Get the number of completed handshakes.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    /// Shutdown the server and drop every open connection.
    pub async fn shutdown(self) {
        let _ = self.closing.send(true);
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    frames: Arc<Vec<String>>,
    after: AfterScript,
    connections: Arc<Mutex<u32>>,
    mut closing: watch::Receiver<bool>,
) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    *connections.lock().await += 1;

    let (mut write, mut read) = ws_stream.split();
    for frame in frames.iter() {
        if write.send(Message::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if after == AfterScript::Drop {
        return;
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    // Flush the queued close echo.
                    let _ = write.close().await;
                    break;
                }
                Some(Err(_)) | None => break,
                _ => {}
            },
            _ = closing.changed() => break,
        }
    }
}

/// A `ws://` URL on which nothing is listening.
pub async fn unused_local_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}
