//! The credential store: single source of truth for the session credential.
//!
//! Readers always get a point-in-time snapshot. Every path that mutates the
//! credential (login, explicit logout, timer expiry, a 401 response) goes
//! through `set` or `clear`, and `clear` is idempotent so the expiry and 401
//! paths can both run without coordinating. Transitions are serialized: a
//! timer deciding its credential is still current and tearing it down happen
//! with no `set` in between.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{ReentrantMutex, RwLock};
use reqwest::header::HeaderValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::credential::Credential;
use super::scheduler::LogoutScheduler;
use super::storage::{meaningful, KeyValueStore, StorageError, EXPIRY_KEY, SUBJECT_KEY, TOKEN_KEY};
use crate::navigation::Navigator;

/// The token cannot be carried in an HTTP header.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid token format")]
pub struct InvalidToken;

pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
    /// Authorization header attached to requests issued from now on
    authorization: RwLock<Option<HeaderValue>>,
    /// Held across each set/clear/expire. Reentrant because an already
    /// expired credential is torn down from inside `set`.
    transition: ReentrantMutex<()>,
    durable: Arc<dyn KeyValueStore>,
    session: Option<Arc<dyn KeyValueStore>>,
    scheduler: LogoutScheduler,
    navigator: Arc<dyn Navigator>,
}

impl CredentialStore {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        session: Option<Arc<dyn KeyValueStore>>,
        navigator: Arc<dyn Navigator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(None),
            authorization: RwLock::new(None),
            transition: ReentrantMutex::new(()),
            durable,
            session,
            scheduler: LogoutScheduler::new(),
            navigator,
        })
    }

    /// Install a new credential, persist it and re-arm the logout timer.
    ///
    /// A credential that is already expired is torn down before this returns.
    pub fn set(
        self: &Arc<Self>,
        token: impl Into<String>,
        expires_at: DateTime<Utc>,
        subject_id: impl Into<String>,
    ) -> Result<(), InvalidToken> {
        let credential = Credential::new(token, expires_at, subject_id);
        let mut header = HeaderValue::from_str(&credential.bearer()).map_err(|_| InvalidToken)?;
        header.set_sensitive(true);

        let _transition = self.transition.lock();
        self.persist(&credential);
        *self.current.write() = Some(credential);
        *self.authorization.write() = Some(header);
        info!(%expires_at, "Credential set");

        let store = Arc::downgrade(self);
        self.scheduler.arm(expires_at, move || {
            if let Some(store) = store.upgrade() {
                store.expire(expires_at);
            }
        });
        Ok(())
    }

    /// Erase the credential and disarm the logout timer. Safe to call any
    /// number of times.
    pub fn clear(&self) {
        let _transition = self.transition.lock();
        let previous = self.current.write().take();
        *self.authorization.write() = None;
        self.scheduler.disarm();
        self.erase_persisted();
        if previous.is_some() {
            info!("Credential cleared");
        }
    }

    /// Terminal session loss: clear and send the user to the entry point.
    pub fn terminate(&self) {
        self.clear();
        self.navigator.redirect_to_unauthenticated_entry();
    }

    /// Snapshot of the current credential
    pub fn read(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    pub fn has_credential(&self) -> bool {
        self.current.read().is_some()
    }

    /// Header value requests should carry right now
    pub fn authorization(&self) -> Option<HeaderValue> {
        self.authorization.read().clone()
    }

    pub fn scheduler(&self) -> &LogoutScheduler {
        &self.scheduler
    }

    pub fn durable(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.durable)
    }

    pub fn session(&self) -> Option<Arc<dyn KeyValueStore>> {
        self.session.clone()
    }

    /// Re-install a credential left in durable storage by a previous run.
    /// Returns whether one was found.
    pub fn restore(self: &Arc<Self>) -> Result<bool, StorageError> {
        let token = meaningful(self.durable.get(TOKEN_KEY)?);
        let expiry = meaningful(self.durable.get(EXPIRY_KEY)?);
        let subject = self.durable.get(SUBJECT_KEY)?.unwrap_or_default();

        let (Some(token), Some(expiry)) = (token, expiry) else {
            return Ok(false);
        };
        let Some(credential) = expiry
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|ms| Credential::from_epoch_millis(token, ms, subject))
        else {
            warn!(expiry = %expiry, "Ignoring persisted credential with unreadable expiry");
            return Ok(false);
        };

        debug!(expires_at = %credential.expires_at, "Restoring persisted credential");
        if self
            .set(credential.token, credential.expires_at, credential.subject_id)
            .is_err()
        {
            warn!("Ignoring persisted credential with malformed token");
            return Ok(false);
        }
        Ok(true)
    }

    /// Stop the logout timer without touching the credential or storage.
    pub fn dispose(&self) {
        self.scheduler.disarm();
    }

    /// Timer path. Only tears down the credential the timer was armed for.
    fn expire(&self, deadline: DateTime<Utc>) {
        {
            let _transition = self.transition.lock();
            let still_current = self
                .current
                .read()
                .as_ref()
                .map(|c| c.expires_at == deadline)
                .unwrap_or(false);
            if !still_current {
                debug!(%deadline, "Stale logout timer ignored");
                return;
            }
            self.clear();
        }
        self.navigator.redirect_to_unauthenticated_entry();
    }

    fn persist(&self, credential: &Credential) {
        let expiry = credential.expires_at_millis().to_string();
        for scope in self.scopes() {
            let result = scope
                .set(TOKEN_KEY, &credential.token)
                .and_then(|_| scope.set(EXPIRY_KEY, &expiry))
                .and_then(|_| scope.set(SUBJECT_KEY, &credential.subject_id));
            if let Err(e) = result {
                warn!(error = %e, "Failed to persist credential");
            }
        }
    }

    fn erase_persisted(&self) {
        for scope in self.scopes() {
            for key in [TOKEN_KEY, EXPIRY_KEY, SUBJECT_KEY] {
                if let Err(e) = scope.remove(key) {
                    warn!(error = %e, key, "Failed to erase persisted credential");
                }
            }
        }
    }

    fn scopes(&self) -> impl Iterator<Item = &Arc<dyn KeyValueStore>> {
        std::iter::once(&self.durable).chain(self.session.iter())
    }
}

impl Drop for CredentialStore {
    fn drop(&mut self) {
        self.scheduler.disarm();
    }
}
