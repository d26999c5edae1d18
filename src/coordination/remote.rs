//! Remote Coordination Backend
//!
//! Talks to a `CoordinationServer` over TCP, one connection per request.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol::{Request, Response};
use super::{CoordinationBackend, CreateMode, SessionId};
use crate::error::{Error, Result};
use crate::network::{read_message, write_message};

/// `CoordinationBackend` backed by a coordination server
pub struct RemoteBackend {
    /// Server address (host:port)
    address: String,
    /// Upper bound for one request-response exchange
    request_timeout: Duration,
    /// Poll interval for deletion watches
    poll_interval: Duration,
}

impl RemoteBackend {
    pub fn new(address: impl Into<String>, request_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            address: address.into(),
            request_timeout,
            poll_interval,
        }
    }

    /// Send one request and wait for its response
    async fn call(&self, request: Request) -> Result<Response> {
        let result = timeout(self.request_timeout, async {
            let mut stream = TcpStream::connect(&self.address).await.map_err(|e| Error::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
            stream.set_nodelay(true)?;

            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &request).await?;
            read_message::<Response, _>(&mut reader).await
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    /// Send a request whose only success answer is `Ok`
    async fn call_ok(&self, request: Request) -> Result<()> {
        let name = request.type_name();
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(other.unexpected(name)),
        }
    }
}

#[async_trait]
impl CoordinationBackend for RemoteBackend {
    async fn open_session(&self, session_timeout: Duration) -> Result<SessionId> {
        let request = Request::OpenSession {
            timeout_ms: session_timeout.as_millis() as u64,
        };
        match self.call(request).await? {
            Response::Session { session } => Ok(session),
            other => Err(other.unexpected("OpenSession")),
        }
    }

    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        self.call_ok(Request::KeepAlive { session }).await
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        self.call_ok(Request::CloseSession { session }).await
    }

    async fn create(&self, session: SessionId, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        self.call_ok(Request::Create {
            session,
            path: path.to_string(),
            data,
            mode,
        })
        .await
    }

    async fn delete(&self, session: SessionId, path: &str) -> Result<()> {
        self.call_ok(Request::Delete {
            session,
            path: path.to_string(),
        })
        .await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.call(Request::Get { path: path.to_string() }).await? {
            Response::Data { data } => Ok(data),
            other => Err(other.unexpected("Get")),
        }
    }

    async fn set(&self, session: SessionId, path: &str, data: Vec<u8>) -> Result<()> {
        self.call_ok(Request::Set {
            session,
            path: path.to_string(),
            data,
        })
        .await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        match self.call(Request::Children { path: path.to_string() }).await? {
            Response::Children { names } => Ok(names),
            other => Err(other.unexpected("Children")),
        }
    }

    async fn wait_for_deletion(&self, path: &str) -> Result<()> {
        loop {
            match self.get(path).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => {}
                // Session loss surfaces through keep-alives; keep polling
                Err(e) if e.is_retryable() => tracing::debug!("Poll of {} failed: {}", path, e),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
