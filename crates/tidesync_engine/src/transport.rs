//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tidesync_protocol::{
    ApplyChangesRequest, ApplyChangesResponse, ChangesRequest, ChangesResponse,
    FullDatasetRequest, ResolveConflictRequest, ResolveConflictResponse, SyncHealth,
    SyncHealthRequest,
};

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, mock for testing).
/// Callers wrap every call in a timeout; implementations need not.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetches records changed since the request's watermark.
    async fn fetch_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse>;

    /// Pushes a batch of local changes.
    async fn apply_changes(&self, request: &ApplyChangesRequest)
        -> SyncResult<ApplyChangesResponse>;

    /// Resolves a conflict on the server.
    async fn resolve_conflict(
        &self,
        request: &ResolveConflictRequest,
    ) -> SyncResult<ResolveConflictResponse>;

    /// Fetches every live record for bootstrap.
    async fn full_dataset(&self, request: &FullDatasetRequest) -> SyncResult<ChangesResponse>;

    /// Asks the server how stale this principal is.
    async fn sync_health(&self, request: &SyncHealthRequest) -> SyncResult<SyncHealth>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// A scriptable transport for testing.
///
/// Responses are served from per-call queues first and fall back to the
/// fixed response set with the `set_*` methods.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    delay: Mutex<Option<Duration>>,
    changes_response: Mutex<Option<ChangesResponse>>,
    full_response: Mutex<Option<ChangesResponse>>,
    apply_response: Mutex<Option<ApplyChangesResponse>>,
    apply_script: Mutex<VecDeque<SyncResult<ApplyChangesResponse>>>,
    resolve_script: Mutex<VecDeque<SyncResult<ResolveConflictResponse>>>,
    health_response: Mutex<Option<SyncHealth>>,
    fail_pull: Mutex<Option<SyncError>>,
    changes_requests: Mutex<Vec<ChangesRequest>>,
    full_requests: Mutex<Vec<FullDatasetRequest>>,
    apply_requests: Mutex<Vec<ApplyChangesRequest>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a new connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            delay: Mutex::new(None),
            changes_response: Mutex::new(None),
            full_response: Mutex::new(None),
            apply_response: Mutex::new(None),
            apply_script: Mutex::new(VecDeque::new()),
            resolve_script: Mutex::new(VecDeque::new()),
            health_response: Mutex::new(None),
            fail_pull: Mutex::new(None),
            changes_requests: Mutex::new(Vec::new()),
            full_requests: Mutex::new(Vec::new()),
            apply_requests: Mutex::new(Vec::new()),
        }
    }

    /// Sets the response to every changes request.
    pub fn set_changes_response(&self, response: ChangesResponse) {
        *self.changes_response.lock() = Some(response);
    }

    /// Sets the response to every full dataset request.
    pub fn set_full_response(&self, response: ChangesResponse) {
        *self.full_response.lock() = Some(response);
    }

    /// Sets the default apply response.
    pub fn set_apply_response(&self, response: ApplyChangesResponse) {
        *self.apply_response.lock() = Some(response);
    }

    /// Queues the result of the next unanswered apply call.
    pub fn push_apply_result(&self, result: SyncResult<ApplyChangesResponse>) {
        self.apply_script.lock().push_back(result);
    }

    /// Queues the result of the next resolve call.
    pub fn push_resolve_result(&self, result: SyncResult<ResolveConflictResponse>) {
        self.resolve_script.lock().push_back(result);
    }

    /// Sets the health response.
    pub fn set_health_response(&self, response: SyncHealth) {
        *self.health_response.lock() = Some(response);
    }

    /// Makes the next pull (changes or full dataset) fail.
    pub fn fail_next_pull(&self, error: SyncError) {
        *self.fail_pull.lock() = Some(error);
    }

    /// Delays every call, for timeout tests.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns every changes request received.
    pub fn changes_requests(&self) -> Vec<ChangesRequest> {
        self.changes_requests.lock().clone()
    }

    /// Returns every full dataset request received.
    pub fn full_requests(&self) -> Vec<FullDatasetRequest> {
        self.full_requests.lock().clone()
    }

    /// Returns every apply request received.
    pub fn apply_requests(&self) -> Vec<ApplyChangesRequest> {
        self.apply_requests.lock().clone()
    }

    async fn begin(&self) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn pull_failure(&self) -> Option<SyncError> {
        self.fail_pull.lock().take()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn fetch_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
        self.changes_requests.lock().push(request.clone());
        self.begin().await?;
        if let Some(error) = self.pull_failure() {
            return Err(error);
        }
        self.changes_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock changes response set".into()))
    }

    async fn apply_changes(
        &self,
        request: &ApplyChangesRequest,
    ) -> SyncResult<ApplyChangesResponse> {
        self.apply_requests.lock().push(request.clone());
        self.begin().await?;
        let scripted = self.apply_script.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => self
                .apply_response
                .lock()
                .clone()
                .ok_or_else(|| SyncError::Protocol("no mock apply response set".into())),
        }
    }

    async fn resolve_conflict(
        &self,
        _request: &ResolveConflictRequest,
    ) -> SyncResult<ResolveConflictResponse> {
        self.begin().await?;
        let scripted = self.resolve_script.lock().pop_front();
        scripted.unwrap_or_else(|| Err(SyncError::Protocol("no mock resolve response set".into())))
    }

    async fn full_dataset(&self, request: &FullDatasetRequest) -> SyncResult<ChangesResponse> {
        self.full_requests.lock().push(request.clone());
        self.begin().await?;
        if let Some(error) = self.pull_failure() {
            return Err(error);
        }
        self.full_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock full dataset response set".into()))
    }

    async fn sync_health(&self, _request: &SyncHealthRequest) -> SyncResult<SyncHealth> {
        self.begin().await?;
        self.health_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock health response set".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
