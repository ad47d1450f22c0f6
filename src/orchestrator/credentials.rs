use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::{json, Value};

use super::config::{AppConfig, IdentityConfig, IdentityKind};
use super::error::{GatewayError, UpstreamError};
use super::secrets::mask_secret;
use super::time::unix_ms;
use super::upstream::{ChatPage, UpstreamClient};

/// Authentication material for the single backend identity this process speaks as.
///
/// Replaced wholesale on refresh; `version` identifies which replacement a chat session was
/// minted under.
#[derive(Clone)]
pub struct Credential {
    pub identity: IdentityKind,
    pub session_token: String,
    pub anti_forgery_token: String,
    pub workspace_id: String,
    pub prompt_template_id: Option<String>,
    pub username: String,
    pub acquired_at_unix_ms: u64,
    pub valid: bool,
    pub version: u64,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("session_token", &mask_secret(&self.session_token))
            .field("anti_forgery_token", &mask_secret(&self.anti_forgery_token))
            .field("workspace_id", &self.workspace_id)
            .field("username", &self.username)
            .field("acquired_at_unix_ms", &self.acquired_at_unix_ms)
            .field("valid", &self.valid)
            .field("version", &self.version)
            .finish()
    }
}

impl Credential {
    /// Redacted view for `/status`.
    pub fn to_status_json(&self) -> Value {
        json!({
            "identity": self.identity.as_str(),
            "username": self.username,
            "workspace_id": self.workspace_id,
            "acquired_at_unix_ms": self.acquired_at_unix_ms,
            "valid": self.valid,
            "version": self.version,
        })
    }
}

fn usable_token(v: &str) -> bool {
    !v.is_empty() && v.bytes().all(|b| b.is_ascii_graphic())
}

pub struct CredentialStore {
    identity: IdentityConfig,
    default_workspace_id: String,
    prompt_template_id: Option<String>,
    upstream: UpstreamClient,
    current: RwLock<Option<Credential>>,
    refresh_gate: tokio::sync::Mutex<()>,
    last_version: AtomicU64,
    skip_renewal: AtomicBool,
    acquisitions: AtomicU64,
}

impl CredentialStore {
    pub fn new(cfg: &AppConfig, upstream: UpstreamClient) -> Self {
        Self {
            identity: cfg.identity.clone(),
            default_workspace_id: cfg.backend.workspace_id.clone(),
            prompt_template_id: cfg.backend.prompt_template_id.clone(),
            upstream,
            current: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            last_version: AtomicU64::new(0),
            skip_renewal: AtomicBool::new(false),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn identity_kind(&self) -> IdentityKind {
        self.identity.kind
    }

    /// Copy of the current credential, valid or not.
    pub fn snapshot(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    /// Version of the current credential, if it is still valid.
    pub fn valid_version(&self) -> Option<u64> {
        self.current
            .read()
            .as_ref()
            .filter(|c| c.valid)
            .map(|c| c.version)
    }

    /// Number of completed acquisition handshakes since startup.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Returns a valid credential, acquiring one first if needed.
    pub async fn current(&self) -> Result<Credential, GatewayError> {
        let cached = self.current.read().as_ref().filter(|c| c.valid).cloned();
        match cached {
            Some(c) => Ok(c),
            None => self.acquire().await,
        }
    }

    /// Makes sure a valid credential exists. Callers that arrive while another acquire is in
    /// flight wait on the gate and then reuse its result instead of starting their own.
    pub async fn acquire(&self) -> Result<Credential, GatewayError> {
        let _gate = self.refresh_gate.lock().await;
        let previous = {
            let cur = self.current.read();
            if let Some(c) = cur.as_ref().filter(|c| c.valid) {
                return Ok(c.clone());
            }
            cur.clone()
        };

        let fresh = match self.identity.kind {
            IdentityKind::Guest => self.acquire_guest(previous.as_ref()).await?,
            IdentityKind::Configured => self.acquire_configured(previous.as_ref()).await?,
        };
        let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        let cred = Credential { version, ..fresh };
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.skip_renewal.store(false, Ordering::Relaxed);
        log::info!(
            "backend credential v{} acquired ({}, user={}, session={})",
            cred.version,
            cred.identity.as_str(),
            if cred.username.is_empty() { "-" } else { cred.username.as_str() },
            mask_secret(&cred.session_token)
        );
        *self.current.write() = Some(cred.clone());
        Ok(cred)
    }

    /// Marks credential `version` as unusable. A no-op if that version was already replaced or
    /// invalidated. Returns whether this call flipped it.
    pub fn invalidate(&self, version: u64) -> bool {
        let mut cur = self.current.write();
        match cur.as_mut() {
            Some(c) if c.version == version && c.valid => {
                c.valid = false;
                log::warn!("backend credential v{version} invalidated");
                true
            }
            _ => false,
        }
    }

    /// Like [`invalidate`](Self::invalidate), and the next guest acquire provisions a brand
    /// new guest instead of renewing this one (its quota is spent).
    pub fn retire(&self, version: u64) -> bool {
        let flipped = self.invalidate(version);
        if flipped && self.identity.kind == IdentityKind::Guest {
            self.skip_renewal.store(true, Ordering::Relaxed);
        }
        flipped
    }

    fn from_page(&self, page: ChatPage, session_token: String) -> Credential {
        Credential {
            identity: self.identity.kind,
            session_token,
            anti_forgery_token: page.csrf_token,
            workspace_id: page
                .workspace_id
                .unwrap_or_else(|| self.default_workspace_id.clone()),
            prompt_template_id: self.prompt_template_id.clone(),
            username: page.username,
            acquired_at_unix_ms: unix_ms(),
            valid: true,
            version: 0,
        }
    }

    /// Reloads the chats page with the previous cookie to pick up a fresh anti-forgery token.
    ///
    /// The backend answers a dead cookie by issuing a brand new guest cookie. A guest may
    /// switch over to it; a configured identity must keep its own session, so a replaced cookie
    /// counts as a failed renewal there.
    async fn renew(&self, previous: &Credential) -> Result<Credential, UpstreamError> {
        let page = self
            .upstream
            .fetch_chats_page(Some(&previous.session_token))
            .await?;
        let session = match page.session_token.clone() {
            None => previous.session_token.clone(),
            Some(same) if same == previous.session_token => same,
            Some(issued) => match self.identity.kind {
                IdentityKind::Guest => issued,
                IdentityKind::Configured => {
                    return Err(UpstreamError::Unauthorized(
                        "backend replaced the configured session with a new guest".to_string(),
                    ));
                }
            },
        };
        let mut cred = self.from_page(page, session);
        if self.identity.kind == IdentityKind::Configured {
            cred.workspace_id = self.default_workspace_id.clone();
        }
        Ok(cred)
    }

    async fn acquire_guest(&self, previous: Option<&Credential>) -> Result<Credential, GatewayError> {
        if let Some(prev) = previous.filter(|_| !self.skip_renewal.load(Ordering::Relaxed)) {
            match self.renew(prev).await {
                Ok(cred) => return Ok(cred),
                Err(e) => log::warn!("guest renewal failed, provisioning a new guest: {e}"),
            }
        }
        let page = self
            .upstream
            .fetch_chats_page(None)
            .await
            .map_err(|e| GatewayError::CredentialUnavailable(format!("guest provisioning failed: {e}")))?;
        let Some(session) = page.session_token.clone() else {
            return Err(GatewayError::CredentialUnavailable(
                "guest provisioning returned no session cookie".to_string(),
            ));
        };
        Ok(self.from_page(page, session))
    }

    async fn acquire_configured(
        &self,
        previous: Option<&Credential>,
    ) -> Result<Credential, GatewayError> {
        let session = self.identity.session.trim();
        let csrf = self.identity.csrf_token.trim();
        if !usable_token(session) || !usable_token(csrf) {
            return Err(GatewayError::CredentialUnavailable(
                "configured identity needs H2OGPTE_SESSION and H2OGPTE_CSRF_TOKEN".to_string(),
            ));
        }
        if let Some(prev) = previous {
            match self.renew(prev).await {
                Ok(cred) => return Ok(cred),
                Err(e) => log::warn!("configured session renewal failed, reloading static values: {e}"),
            }
        }
        Ok(Credential {
            identity: IdentityKind::Configured,
            session_token: session.to_string(),
            anti_forgery_token: csrf.to_string(),
            workspace_id: self.default_workspace_id.clone(),
            prompt_template_id: self.prompt_template_id.clone(),
            username: String::new(),
            acquired_at_unix_ms: unix_ms(),
            valid: true,
            version: 0,
        })
    }
}
