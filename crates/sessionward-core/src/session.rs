//! The session service object.
//!
//! `Session` owns one instance of every component and wires them together:
//! storage backends, the credential store and its logout timer, the status
//! resolver, the interceptor pipeline and the HTTP client. It must be
//! created inside a tokio runtime since restoring a persisted credential
//! arms the logout timer.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{
    ApiClient, ApiEnvelope, ApiError, ChangePasswordRequest, LogSettings, LoginRequest, LoginResponse, Pipeline,
};
use crate::auth::resolver::{AuthCheck, ExpiryCheck};
use crate::auth::{
    AuthStatus, AuthStatusResolver, CredentialStore, FileStore, KeyValueStore, KeyringStore, MemoryStore,
};
use crate::config::{Config, ConfigError, Persistence};
use crate::navigation::Navigator;

pub struct Session {
    config: Config,
    store: Arc<CredentialStore>,
    resolver: Arc<AuthStatusResolver>,
    client: ApiClient,
}

impl Session {
    /// Build a session over the storage backend selected in `config` and
    /// restore any credential left by a previous run.
    pub fn init(config: Config, navigator: Arc<dyn Navigator>) -> Result<Self> {
        let durable: Arc<dyn KeyValueStore> = match config.persistence {
            Persistence::File => {
                let path = config.session_file()?;
                Arc::new(
                    FileStore::open(&path)
                        .with_context(|| format!("Failed to open session store {}", path.display()))?,
                )
            }
            Persistence::Keyring => Arc::new(KeyringStore::new()),
        };
        let mirror: Option<Arc<dyn KeyValueStore>> = config
            .mirror_session
            .then(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);

        Self::with_stores(config, durable, mirror, navigator)
    }

    /// Build a session over caller-supplied storage.
    pub fn with_stores(
        config: Config,
        durable: Arc<dyn KeyValueStore>,
        mirror: Option<Arc<dyn KeyValueStore>>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self> {
        let store = CredentialStore::new(durable, mirror, navigator);

        let resolver = Arc::new(AuthStatusResolver::new(Arc::clone(&store)));
        resolver.use_auth_strategy(&config.auth_strategy)?;
        resolver.use_expiry_strategy(&config.expiry_strategy)?;

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            config.codes.clone(),
            config.logging.clone(),
        ));
        let client = ApiClient::new(&config, pipeline)?;

        match store.restore() {
            Ok(true) => info!("Restored persisted session"),
            Ok(false) => debug!("No persisted session"),
            Err(e) => warn!(error = %e, "Failed to read persisted session"),
        }

        Ok(Self {
            config,
            store,
            resolver,
            client,
        })
    }

    /// Stop the logout timer. Persisted state is left for the next run.
    pub fn dispose(&self) {
        self.store.dispose();
        debug!("Session disposed");
    }

    /// Authenticate and install the returned credential.
    ///
    /// Envelopes without a token (for example when a second factor is still
    /// required) are handed back without touching session state.
    pub async fn login(&self, user_id: &str, password: &str) -> Result<ApiEnvelope<LoginResponse>, ApiError> {
        let request = LoginRequest {
            user_id: user_id.to_string(),
            password: password.to_string(),
            mac_address: Some(self.client.fetch_mac_address().await),
        };
        let envelope = self.client.login(&request).await?;
        if self.install(&envelope, user_id)? {
            info!(user_id, "Logged in");
        } else {
            info!(user_id, code = %envelope.code, "Login returned no credential");
        }
        Ok(envelope)
    }

    /// Log out on the server and locally. The local session is torn down
    /// whatever the server says; its result is still returned.
    pub async fn logout(&self) -> Result<ApiEnvelope<Value>, ApiError> {
        let result = self.client.logout().await;
        if let Err(e) = &result {
            warn!(error = %e, "Server logout failed");
        }
        self.store.terminate();
        info!("Logged out");
        result
    }

    /// Change the signed-in user's password. Session state is untouched.
    pub async fn change_password(&self, new_password: &str) -> Result<ApiEnvelope<Value>, ApiError> {
        let request = ChangePasswordRequest {
            new_password: new_password.to_string(),
            mac_address: self.client.fetch_mac_address().await,
        };
        let envelope = self.client.change_password(&request).await?;
        info!(code = %envelope.code, "Password changed");
        Ok(envelope)
    }

    /// Exchange the current credential for a fresh one and re-arm the
    /// logout timer.
    pub async fn renew_token(&self) -> Result<ApiEnvelope<LoginResponse>, ApiError> {
        let subject = self.store.read().map(|c| c.subject_id).unwrap_or_default();
        let envelope = self.client.get_token().await?;
        if self.install(&envelope, &subject)? {
            info!("Token renewed");
        }
        Ok(envelope)
    }

    pub async fn status(&self) -> AuthStatus {
        self.resolver.resolve().await
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<AuthStatusResolver> {
        &self.resolver
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runtime configuration surface, only available with `dev` enabled.
    pub fn dev_tools(&self) -> Result<DevTools, ConfigError> {
        if !self.config.dev {
            return Err(ConfigError::DevToolsDisabled);
        }
        Ok(DevTools {
            resolver: Arc::clone(&self.resolver),
            pipeline: Arc::clone(self.client.pipeline()),
        })
    }

    fn install(&self, envelope: &ApiEnvelope<LoginResponse>, subject_id: &str) -> Result<bool, ApiError> {
        let Some(data) = &envelope.data else {
            return Ok(false);
        };
        let (Some(token), Some(expiry_ms)) = (&data.access_token, data.access_token_expiry) else {
            return Ok(false);
        };

        let expires_at = Utc
            .timestamp_millis_opt(expiry_ms)
            .single()
            .ok_or_else(|| ApiError::InvalidResponse(format!("invalid token expiry {}", expiry_ms)))?;
        self.store
            .set(token.as_str(), expires_at, subject_id)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(true)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Development-only handle for switching strategies and logger settings
/// while the session runs.
pub struct DevTools {
    resolver: Arc<AuthStatusResolver>,
    pipeline: Arc<Pipeline>,
}

impl DevTools {
    pub fn use_auth_strategy(&self, name: &str) -> Result<(), ConfigError> {
        self.resolver.use_auth_strategy(name)
    }

    pub fn use_expiry_strategy(&self, name: &str) -> Result<(), ConfigError> {
        self.resolver.use_expiry_strategy(name)
    }

    pub fn set_auth_strategy(&self, strategy: AuthCheck) {
        self.resolver.set_auth_strategy(strategy);
    }

    pub fn set_expiry_strategy(&self, strategy: ExpiryCheck) {
        self.resolver.set_expiry_strategy(strategy);
    }

    pub fn auth_strategies(&self) -> Vec<&'static str> {
        self.resolver.registry().auth_names()
    }

    pub fn expiry_strategies(&self) -> Vec<&'static str> {
        self.resolver.registry().expiry_names()
    }

    pub fn log_settings(&self) -> LogSettings {
        self.pipeline.log_settings()
    }

    pub fn set_log_settings(&self, settings: LogSettings) {
        self.pipeline.set_log_settings(settings);
    }
}
