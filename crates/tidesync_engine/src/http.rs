//! HTTP transport implementation.
//!
//! Every request is a CBOR-encoded [`Envelope`] posted to the message's
//! endpoint; every response is a CBOR-encoded [`SyncMessage`]. The actual
//! HTTP client is abstracted via a trait so any library (or an in-process
//! loopback) can carry the bytes.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidesync_protocol::{
    from_cbor, ApplyChangesRequest, ApplyChangesResponse, ChangesRequest, ChangesResponse,
    Envelope, FullDatasetRequest, ResolveConflictRequest, ResolveConflictResponse, SyncHealth,
    SyncHealthRequest, SyncMessage,
};
use tracing::warn;

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    client: C,
    credential: Option<Vec<u8>>,
    closed: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            credential: None,
            closed: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    /// Attaches a bearer credential to every request.
    pub fn with_credential(mut self, credential: impl Into<Vec<u8>>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Stops sending requests.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn exchange(&self, message: SyncMessage) -> SyncResult<SyncMessage> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let endpoint = message.endpoint().ok_or_else(|| {
            SyncError::Protocol(format!("{} is not a request", message.name()))
        })?;

        let body = Envelope::new(self.credential.clone(), message).encode()?;
        let url = format!("{}{}", self.base_url, endpoint);

        let response_body = match self.client.post(&url, body).await {
            Ok(bytes) => {
                *self.last_error.write() = None;
                bytes
            }
            Err(e) => {
                warn!(url = %url, error = %e, "sync request failed");
                *self.last_error.write() = Some(e.clone());
                return Err(SyncError::transport_retryable(e));
            }
        };

        match from_cbor::<SyncMessage>(&response_body)? {
            SyncMessage::Error(reply) => Err(reply.into()),
            other => Ok(other),
        }
    }
}

fn unexpected(expected: &str, actual: &SyncMessage) -> SyncError {
    SyncError::Protocol(format!("expected {expected}, got {}", actual.name()))
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn fetch_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
        match self
            .exchange(SyncMessage::ChangesRequest(request.clone()))
            .await?
        {
            SyncMessage::ChangesResponse(response) => Ok(response),
            other => Err(unexpected("ChangesResponse", &other)),
        }
    }

    async fn apply_changes(
        &self,
        request: &ApplyChangesRequest,
    ) -> SyncResult<ApplyChangesResponse> {
        match self
            .exchange(SyncMessage::ApplyChangesRequest(request.clone()))
            .await?
        {
            SyncMessage::ApplyChangesResponse(response) => Ok(response),
            other => Err(unexpected("ApplyChangesResponse", &other)),
        }
    }

    async fn resolve_conflict(
        &self,
        request: &ResolveConflictRequest,
    ) -> SyncResult<ResolveConflictResponse> {
        match self
            .exchange(SyncMessage::ResolveConflictRequest(request.clone()))
            .await?
        {
            SyncMessage::ResolveConflictResponse(response) => Ok(response),
            other => Err(unexpected("ResolveConflictResponse", &other)),
        }
    }

    async fn full_dataset(&self, request: &FullDatasetRequest) -> SyncResult<ChangesResponse> {
        match self
            .exchange(SyncMessage::FullDatasetRequest(request.clone()))
            .await?
        {
            SyncMessage::ChangesResponse(response) => Ok(response),
            other => Err(unexpected("ChangesResponse", &other)),
        }
    }

    async fn sync_health(&self, request: &SyncHealthRequest) -> SyncResult<SyncHealth> {
        match self
            .exchange(SyncMessage::SyncHealthRequest(request.clone()))
            .await?
        {
            SyncMessage::SyncHealth(health) => Ok(health),
            other => Err(unexpected("SyncHealth", &other)),
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.client.is_healthy()
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        (**self).handle_post(path, body)
    }
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead. The link can be cut
/// with [`LoopbackClient::set_online`] to simulate going offline.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    online: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("network unreachable".into());
        }
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
