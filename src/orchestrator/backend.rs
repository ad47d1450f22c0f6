use std::sync::Arc;

use futures_util::StreamExt;

use super::config::IdentityKind;
use super::credentials::{Credential, CredentialStore};
use super::error::{GatewayError, UpstreamError};
use super::pool::{BackendSession, SessionLease, SessionPool};
use super::time::unix_ms;
use super::upstream::{BackendQuery, ChatChunks, UpstreamClient};

/// A chat answer that has started: the session it runs on plus the remaining chunks.
///
/// The first chunk (if any) was already read, so an auth failure could still be retried.
pub struct ChatReply {
    pub lease: SessionLease,
    pub chunks: ChatChunks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Second,
}

/// The only component that talks to the backend on behalf of requests.
pub struct BackendGateway {
    credentials: Arc<CredentialStore>,
    upstream: UpstreamClient,
}

impl BackendGateway {
    pub fn new(credentials: Arc<CredentialStore>, upstream: UpstreamClient) -> Self {
        Self {
            credentials,
            upstream,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    async fn try_create(&self, cred: &Credential) -> Result<BackendSession, UpstreamError> {
        let session_id = self.upstream.create_chat_session(cred).await?;
        Ok(BackendSession {
            session_id,
            created_at_unix_ms: unix_ms(),
            credential_version: cred.version,
        })
    }

    /// Creates a chat session under the current credential. An auth rejection refreshes the
    /// credential and tries once more.
    pub async fn create_session(&self) -> Result<BackendSession, GatewayError> {
        let mut attempt = Attempt::First;
        loop {
            let cred = self.credentials.current().await?;
            match self.try_create(&cred).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_auth_failure() => {
                    self.credentials.invalidate(cred.version);
                    if attempt == Attempt::Second {
                        return Err(GatewayError::BackendAuthFailed(e.to_string()));
                    }
                    log::warn!("session creation rejected credential v{}, refreshing", cred.version);
                    self.credentials.acquire().await?;
                    attempt = Attempt::Second;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Opens the chat and reads up to the first content chunk.
    async fn try_send(
        &self,
        cred: &Credential,
        lease: &SessionLease,
        query: &BackendQuery,
    ) -> Result<ChatChunks, UpstreamError> {
        let mut chunks = self
            .upstream
            .open_chat(cred, lease.session_id(), query)
            .await?;
        match chunks.next().await {
            Some(Ok(first)) => Ok(futures_util::stream::once(async move { Ok::<_, UpstreamError>(first) })
                .chain(chunks)
                .boxed()),
            Some(Err(e)) => Err(e),
            None => Ok(futures_util::stream::empty().boxed()),
        }
    }

    /// Sends `query` on the leased session.
    ///
    /// An authentication failure invalidates the credential, refreshes it, swaps the session for
    /// a fresh one and tries exactly once more. A second failure is `BackendAuthFailed`. Nothing
    /// else is retried. The lease is evicted on every failure.
    pub async fn send(
        &self,
        pool: &SessionPool,
        lease: SessionLease,
        query: &BackendQuery,
    ) -> Result<ChatReply, GatewayError> {
        let mut lease = lease;
        let mut attempt = Attempt::First;
        loop {
            let cred = self.credentials.current().await?;
            if lease.credential_version() != cred.version {
                // Refreshed by someone else since checkout.
                pool.evict(lease);
                lease = pool.checkout().await?;
            }

            let result = self.try_send(&cred, &lease, query).await;
            let failure = match result {
                Ok(chunks) => return Ok(ChatReply { lease, chunks }),
                Err(e) => e,
            };
            pool.evict(lease);

            match failure {
                e if e.is_auth_failure() => {
                    self.credentials.invalidate(cred.version);
                    if attempt == Attempt::Second {
                        log::error!("backend still rejects credentials after refresh: {e}");
                        return Err(GatewayError::BackendAuthFailed(e.to_string()));
                    }
                    log::warn!(
                        "backend rejected credential v{} mid-request, refreshing and retrying once",
                        cred.version
                    );
                    self.credentials.acquire().await?;
                    lease = pool.checkout().await?;
                    attempt = Attempt::Second;
                }
                UpstreamError::RateLimited(m) => {
                    if cred.identity == IdentityKind::Guest {
                        // This guest's quota is spent; the next acquire provisions a new one.
                        self.credentials.retire(cred.version);
                    }
                    return Err(GatewayError::RateLimited(m));
                }
                e => return Err(e.into()),
            }
        }
    }
}
