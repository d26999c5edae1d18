//! Coordination Server
//!
//! TCP front end over a `MemoryBackend` for clusters spanning processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::protocol::{Request, Response};
use super::{CoordinationBackend, MemoryBackend};
use crate::error::{Error, Result};
use crate::network::{read_message, write_message};

/// Coordination service reachable over TCP
pub struct CoordinationServer {
    /// Bind address
    bind_address: String,
    /// Namespace and sessions
    backend: Arc<MemoryBackend>,
    /// How often expired sessions are reaped
    reap_interval: Duration,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl CoordinationServer {
    /// Create a new coordination server
    pub fn new(bind_address: String, reap_interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            backend: Arc::new(MemoryBackend::new()),
            reap_interval,
            shutdown: shutdown_tx,
        }
    }

    /// Backend served by this server
    pub fn backend(&self) -> Arc<MemoryBackend> {
        Arc::clone(&self.backend)
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!("Coordination server listening on {}", local);

        let mut shutdown_rx = self.shutdown.subscribe();
        let reaper = self.backend.spawn_reaper(self.reap_interval, self.shutdown.subscribe());

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let backend = Arc::clone(&self.backend);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, backend).await {
                                    tracing::warn!("Coordination connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        reaper.abort();
        tracing::info!("Coordination server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve requests on one connection until the peer hangs up
async fn handle_connection(socket: TcpStream, peer_addr: &str, backend: Arc<MemoryBackend>) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request: Request = match read_message(&mut reader).await {
            Ok(request) => request,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        tracing::trace!("Received {} from {}", request.type_name(), peer_addr);
        let response = handle_request(backend.as_ref(), request).await;
        write_message(&mut writer, &response).await?;
    }

    Ok(())
}

/// Apply one request to the backend
pub(crate) async fn handle_request(backend: &dyn CoordinationBackend, request: Request) -> Response {
    let result = match request {
        Request::OpenSession { timeout_ms } => backend
            .open_session(Duration::from_millis(timeout_ms))
            .await
            .map(|session| Response::Session { session }),
        Request::KeepAlive { session } => backend.keep_alive(session).await.map(|_| Response::Ok),
        Request::CloseSession { session } => backend.close_session(session).await.map(|_| Response::Ok),
        Request::Create { session, path, data, mode } => {
            backend.create(session, &path, data, mode).await.map(|_| Response::Ok)
        }
        Request::Delete { session, path } => backend.delete(session, &path).await.map(|_| Response::Ok),
        Request::Get { path } => backend.get(&path).await.map(|data| Response::Data { data }),
        Request::Set { session, path, data } => backend.set(session, &path, data).await.map(|_| Response::Ok),
        Request::Children { path } => backend.children(&path).await.map(|names| Response::Children { names }),
    };

    result.unwrap_or_else(|e| Response::from_error(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CreateMode;

    #[tokio::test]
    async fn test_handle_request_maps_errors() {
        let backend = MemoryBackend::new();
        let session = match handle_request(&backend, Request::OpenSession { timeout_ms: 10_000 }).await {
            Response::Session { session } => session,
            other => panic!("unexpected {:?}", other),
        };

        let create = Request::Create {
            session,
            path: "/n/leader".into(),
            data: b"a:1".to_vec(),
            mode: CreateMode::Ephemeral,
        };
        assert!(matches!(handle_request(&backend, create.clone()).await, Response::Ok));
        assert!(matches!(
            handle_request(&backend, create).await,
            Response::Error { code: crate::coordination::protocol::ErrorCode::NodeExists, .. }
        ));
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let server = Arc::new(CoordinationServer::new("127.0.0.1:0".into(), Duration::from_millis(50)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.stop();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
