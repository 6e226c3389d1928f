//! Main sync server.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::service::SyncService;
use std::sync::Arc;
use tidesync_engine::LoopbackServer;
use tidesync_protocol::{to_cbor, Envelope, SyncMessage};
use tidesync_store::{Clock, MemoryRecordStore, RecordStore, SystemClock};
use tracing::{debug, warn};

/// The sync server.
///
/// Authenticates request envelopes and dispatches them to a
/// [`SyncService`]. Transport is left to the embedder; the
/// [`LoopbackServer`] impl lets an in-process client talk to it directly.
///
/// # Example
///
/// ```
/// use tidesync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
///
/// // In a real application, you would expose HTTP endpoints
/// // that call server.handle_envelope()
/// assert!(server.service().store().is_empty());
/// ```
pub struct SyncServer<S: RecordStore = MemoryRecordStore> {
    service: SyncService<S>,
    validator: Option<TokenValidator>,
}

impl SyncServer<MemoryRecordStore> {
    /// Creates a server over an empty in-memory store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryRecordStore::new()), Arc::new(SystemClock))
    }
}

impl<S: RecordStore> SyncServer<S> {
    /// Creates a server over `store`, reading time from `clock`.
    pub fn with_store(config: ServerConfig, store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => Some(TokenValidator::with_clock(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
                Arc::clone(&clock),
            )),
            _ => None,
        };
        Self {
            service: SyncService::with_clock(config, store, clock),
            validator,
        }
    }

    /// Returns the service.
    pub fn service(&self) -> &SyncService<S> {
        &self.service
    }

    /// Returns the token validator when authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Checks the envelope's credential against the request's principal.
    pub fn authenticate(&self, envelope: &Envelope) -> ServerResult<()> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let principal = envelope.message.principal().ok_or_else(|| {
            ServerError::InvalidRequest(format!("{} is not a request", envelope.message.name()))
        })?;
        let credential = envelope
            .credential
            .as_deref()
            .ok_or_else(|| ServerError::AuthenticationFailed("missing credential".into()))?;
        validator.validate_token(credential, principal)
    }

    /// Handles a sync message (dispatches to appropriate handler).
    pub fn handle_message(&self, message: SyncMessage) -> ServerResult<SyncMessage> {
        match message {
            SyncMessage::ChangesRequest(req) => self
                .service
                .handle_changes(req)
                .map(SyncMessage::ChangesResponse),
            SyncMessage::ApplyChangesRequest(req) => self
                .service
                .handle_apply(req)
                .map(SyncMessage::ApplyChangesResponse),
            SyncMessage::ResolveConflictRequest(req) => self
                .service
                .handle_resolve(req)
                .map(SyncMessage::ResolveConflictResponse),
            SyncMessage::FullDatasetRequest(req) => self
                .service
                .handle_full(req)
                .map(SyncMessage::ChangesResponse),
            SyncMessage::SyncHealthRequest(req) => {
                self.service.handle_health(req).map(SyncMessage::SyncHealth)
            }
            other => Err(ServerError::InvalidRequest(format!(
                "unexpected message type {}",
                other.name()
            ))),
        }
    }

    /// Authenticates and handles an envelope. Failures become error replies.
    pub fn handle_envelope(&self, envelope: Envelope) -> SyncMessage {
        let name = envelope.message.name();
        let result = self
            .authenticate(&envelope)
            .and_then(|()| self.handle_message(envelope.message));
        match result {
            Ok(reply) => reply,
            Err(error) => {
                if error.is_server_error() {
                    warn!(request = name, error = %error, "request failed");
                } else {
                    debug!(request = name, error = %error, "request refused");
                }
                SyncMessage::Error(error.to_reply())
            }
        }
    }

    /// Handles a CBOR request body posted to `path`.
    pub fn handle_bytes(&self, path: &str, body: &[u8]) -> SyncMessage {
        let envelope = match Envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(e) => return SyncMessage::Error(ServerError::from(e).to_reply()),
        };
        if envelope.message.endpoint() != Some(path) {
            return SyncMessage::Error(
                ServerError::InvalidRequest(format!(
                    "{} cannot be posted to {path}",
                    envelope.message.name()
                ))
                .to_reply(),
            );
        }
        self.handle_envelope(envelope)
    }
}

impl<S: RecordStore> LoopbackServer for SyncServer<S> {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        to_cbor(&self.handle_bytes(path, body)).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_protocol::{
        from_cbor, ChangesRequest, ErrorKind, PrincipalId, SyncHealthRequest,
    };
    use tidesync_store::ManualClock;

    fn health(principal: &str) -> SyncMessage {
        SyncMessage::SyncHealthRequest(SyncHealthRequest {
            principal: PrincipalId::new(principal),
        })
    }

    fn authed_server() -> SyncServer {
        let config = ServerConfig::new().with_auth(b"server-secret".to_vec());
        SyncServer::with_store(
            config,
            Arc::new(MemoryRecordStore::new()),
            Arc::new(ManualClock::new(10_000)),
        )
    }

    #[test]
    fn message_dispatch() {
        let server = SyncServer::new(ServerConfig::default());
        let reply = server.handle_message(health("alice")).unwrap();
        assert!(matches!(reply, SyncMessage::SyncHealth(_)));

        let err = server
            .handle_message(SyncMessage::SyncHealth(tidesync_protocol::SyncHealth::evaluate(None, 0, 1)))
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn auth_required_when_configured() {
        let server = authed_server();
        let reply = server.handle_envelope(Envelope::new(None, health("alice")));
        assert!(matches!(
            reply,
            SyncMessage::Error(ref e) if e.kind == ErrorKind::Unauthorized
        ));

        let token = server
            .validator()
            .unwrap()
            .create_token(&PrincipalId::new("alice"))
            .unwrap();
        let reply = server.handle_envelope(Envelope::new(Some(token.clone()), health("alice")));
        assert!(matches!(reply, SyncMessage::SyncHealth(_)));

        // A token cannot be replayed for another principal.
        let reply = server.handle_envelope(Envelope::new(Some(token), health("bob")));
        assert!(matches!(reply, SyncMessage::Error(_)));
    }

    #[test]
    fn path_must_match_message() {
        let server = SyncServer::new(ServerConfig::default());
        let body = Envelope::new(None, health("alice")).encode().unwrap();

        let reply: SyncMessage = from_cbor(&server.handle_post("/sync/health", &body).unwrap()).unwrap();
        assert!(matches!(reply, SyncMessage::SyncHealth(_)));

        let reply: SyncMessage = from_cbor(&server.handle_post("/sync/apply", &body).unwrap()).unwrap();
        assert!(matches!(
            reply,
            SyncMessage::Error(ref e) if e.kind == ErrorKind::InvalidRequest
        ));
    }

    #[test]
    fn garbage_body_is_invalid_request() {
        let server = SyncServer::new(ServerConfig::default());
        let reply = server.handle_bytes("/sync/changes", b"\xff\x00garbage");
        assert!(matches!(
            reply,
            SyncMessage::Error(ref e) if e.kind == ErrorKind::InvalidRequest
        ));
    }

    #[test]
    fn request_errors_become_replies() {
        let server = SyncServer::new(ServerConfig::default());
        let request = SyncMessage::ChangesRequest(ChangesRequest::new(PrincipalId::new("alice"), Vec::new(), 0));
        let reply = server.handle_envelope(Envelope::new(None, request));
        assert!(matches!(reply, SyncMessage::Error(_)));
    }
}
