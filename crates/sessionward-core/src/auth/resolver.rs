//! Authentication status resolution.
//!
//! Several independent and possibly stale signals can say whether the user
//! is logged in: durable storage, the session-scoped mirror, the attached
//! header default, a token payload, an externally injected session object,
//! a custom hook. Each is a function from a `SignalContext` snapshot to an
//! optional signal, and a strategy is either one of them or a first-match
//! fold over an ordered list of them.
//!
//! Two strategies are active at any time, one for "is authenticated" and one
//! for "when does it expire". Both can be swapped at runtime by registry name
//! or by supplying a function.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use reqwest::header::HeaderValue;
use tracing::{debug, info};

use super::credential::AuthStatus;
use super::storage::{first_present, KeyValueStore, EXPIRY_ALIASES, TOKEN_ALIASES};
use super::store::CredentialStore;
use super::token::payload_expiry;
use crate::config::{ConfigError, DEFAULT_STRATEGY};

pub type SignalFuture<T> = BoxFuture<'static, anyhow::Result<Option<T>>>;

/// A signal source or a strategy built from several of them.
pub type SignalFn<T> = Arc<dyn Fn(SignalContext) -> SignalFuture<T> + Send + Sync>;

pub type AuthCheck = SignalFn<bool>;
pub type ExpiryCheck = SignalFn<DateTime<Utc>>;

/// A session object owned by someone else (an embedding application, an SSO
/// helper) that can vouch for the user.
pub trait ExternalSession: Send + Sync {
    fn is_authenticated(&self) -> BoxFuture<'_, anyhow::Result<Option<bool>>>;
    fn expires_at(&self) -> BoxFuture<'_, anyhow::Result<Option<DateTime<Utc>>>>;
}

/// Everything a signal source may look at, captured once per resolution.
#[derive(Clone)]
pub struct SignalContext {
    pub durable: Arc<dyn KeyValueStore>,
    pub session: Option<Arc<dyn KeyValueStore>>,
    pub authorization: Option<HeaderValue>,
    pub injected: Option<Arc<dyn ExternalSession>>,
    pub hook: Option<Arc<dyn ExternalSession>>,
}

/// Fold `sources` in order, stopping at the first definite signal.
pub fn first_match<T: Send + 'static>(sources: Vec<SignalFn<T>>) -> SignalFn<T> {
    let sources = Arc::new(sources);
    Arc::new(move |ctx: SignalContext| {
        let sources = Arc::clone(&sources);
        async move {
            for source in sources.iter() {
                if let Some(signal) = source(ctx.clone()).await? {
                    return Ok(Some(signal));
                }
            }
            Ok::<_, anyhow::Error>(None)
        }
        .boxed()
    })
}

fn signal<T, F>(f: F) -> SignalFn<T>
where
    F: Fn(SignalContext) -> SignalFuture<T> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn parse_expiry(raw: Option<String>) -> Option<DateTime<Utc>> {
    let ms = raw?.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(ms).single()
}

/// Built-in sources, keyed by the names accepted at runtime.
pub mod sources {
    use super::*;

    pub const PERSISTED: &str = "persisted";
    pub const SESSION: &str = "session";
    pub const HEADER: &str = "header";
    pub const JWT: &str = "jwt";
    pub const INJECTED: &str = "injected";
    pub const CUSTOM: &str = "custom";

    pub fn persisted_token() -> AuthCheck {
        signal(|ctx| {
            async move {
                let token = first_present(ctx.durable.as_ref(), TOKEN_ALIASES)?;
                Ok::<_, anyhow::Error>(token.map(|_| true))
            }
            .boxed()
        })
    }

    pub fn session_token() -> AuthCheck {
        signal(|ctx| {
            async move {
                match ctx.session {
                    Some(store) => Ok::<_, anyhow::Error>(first_present(store.as_ref(), TOKEN_ALIASES)?.map(|_| true)),
                    None => Ok(None),
                }
            }
            .boxed()
        })
    }

    pub fn attached_header() -> AuthCheck {
        signal(|ctx| async move { Ok(ctx.authorization.is_some().then_some(true)) }.boxed())
    }

    pub fn injected_auth() -> AuthCheck {
        signal(|ctx| {
            async move {
                match ctx.injected {
                    Some(session) => session.is_authenticated().await,
                    None => Ok(None),
                }
            }
            .boxed()
        })
    }

    pub fn custom_auth() -> AuthCheck {
        signal(|ctx| {
            async move {
                match ctx.hook {
                    Some(hook) => hook.is_authenticated().await,
                    None => Ok(None),
                }
            }
            .boxed()
        })
    }

    pub fn persisted_expiry() -> ExpiryCheck {
        signal(|ctx| {
            async move {
                let raw = first_present(ctx.durable.as_ref(), EXPIRY_ALIASES)?;
                Ok::<_, anyhow::Error>(parse_expiry(raw))
            }
            .boxed()
        })
    }

    pub fn session_expiry() -> ExpiryCheck {
        signal(|ctx| {
            async move {
                match ctx.session {
                    Some(store) => Ok::<_, anyhow::Error>(parse_expiry(first_present(store.as_ref(), EXPIRY_ALIASES)?)),
                    None => Ok(None),
                }
            }
            .boxed()
        })
    }

    /// Decode `exp` from the persisted token, falling back to the session copy.
    pub fn token_payload_expiry() -> ExpiryCheck {
        signal(|ctx| {
            async move {
                let mut token = first_present(ctx.durable.as_ref(), TOKEN_ALIASES)?;
                if token.is_none() {
                    if let Some(store) = &ctx.session {
                        token = first_present(store.as_ref(), TOKEN_ALIASES)?;
                    }
                }
                Ok::<_, anyhow::Error>(token.as_deref().and_then(payload_expiry))
            }
            .boxed()
        })
    }

    pub fn injected_expiry() -> ExpiryCheck {
        signal(|ctx| {
            async move {
                match ctx.injected {
                    Some(session) => session.expires_at().await,
                    None => Ok(None),
                }
            }
            .boxed()
        })
    }

    pub fn custom_expiry() -> ExpiryCheck {
        signal(|ctx| {
            async move {
                match ctx.hook {
                    Some(hook) => hook.expires_at().await,
                    None => Ok(None),
                }
            }
            .boxed()
        })
    }

    /// persisted -> session -> header -> injected -> custom
    pub fn default_auth_chain() -> AuthCheck {
        first_match(vec![
            persisted_token(),
            session_token(),
            attached_header(),
            injected_auth(),
            custom_auth(),
        ])
    }

    /// persisted -> session -> jwt -> injected -> custom
    pub fn default_expiry_chain() -> ExpiryCheck {
        first_match(vec![
            persisted_expiry(),
            session_expiry(),
            token_payload_expiry(),
            injected_expiry(),
            custom_expiry(),
        ])
    }
}

/// Name -> strategy mapping for both signal kinds.
pub struct StrategyRegistry {
    auth: BTreeMap<&'static str, AuthCheck>,
    expiry: BTreeMap<&'static str, ExpiryCheck>,
}

impl StrategyRegistry {
    pub fn builtin() -> Self {
        let mut auth: BTreeMap<&'static str, AuthCheck> = BTreeMap::new();
        auth.insert(sources::PERSISTED, sources::persisted_token());
        auth.insert(sources::SESSION, sources::session_token());
        auth.insert(sources::HEADER, sources::attached_header());
        auth.insert(sources::INJECTED, sources::injected_auth());
        auth.insert(sources::CUSTOM, sources::custom_auth());
        auth.insert(DEFAULT_STRATEGY, sources::default_auth_chain());

        let mut expiry: BTreeMap<&'static str, ExpiryCheck> = BTreeMap::new();
        expiry.insert(sources::PERSISTED, sources::persisted_expiry());
        expiry.insert(sources::SESSION, sources::session_expiry());
        expiry.insert(sources::JWT, sources::token_payload_expiry());
        expiry.insert(sources::INJECTED, sources::injected_expiry());
        expiry.insert(sources::CUSTOM, sources::custom_expiry());
        expiry.insert(DEFAULT_STRATEGY, sources::default_expiry_chain());

        Self { auth, expiry }
    }

    pub fn auth(&self, name: &str) -> Result<AuthCheck, ConfigError> {
        self.auth.get(name).cloned().ok_or_else(|| ConfigError::UnknownStrategy {
            kind: "auth",
            name: name.to_string(),
            available: self.auth_names().join(", "),
        })
    }

    pub fn expiry(&self, name: &str) -> Result<ExpiryCheck, ConfigError> {
        self.expiry.get(name).cloned().ok_or_else(|| ConfigError::UnknownStrategy {
            kind: "expiry",
            name: name.to_string(),
            available: self.expiry_names().join(", "),
        })
    }

    pub fn auth_names(&self) -> Vec<&'static str> {
        self.auth.keys().copied().collect()
    }

    pub fn expiry_names(&self) -> Vec<&'static str> {
        self.expiry.keys().copied().collect()
    }
}

pub struct AuthStatusResolver {
    store: Arc<CredentialStore>,
    registry: StrategyRegistry,
    auth: RwLock<AuthCheck>,
    expiry: RwLock<ExpiryCheck>,
    injected: RwLock<Option<Arc<dyn ExternalSession>>>,
    hook: RwLock<Option<Arc<dyn ExternalSession>>>,
}

impl AuthStatusResolver {
    /// Resolver using the default priority chains.
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self::with_strategies(store, sources::default_auth_chain(), sources::default_expiry_chain())
    }

    /// Resolver folding over the given source lists instead of the defaults.
    pub fn with_sources(
        store: Arc<CredentialStore>,
        auth_sources: Vec<AuthCheck>,
        expiry_sources: Vec<ExpiryCheck>,
    ) -> Self {
        Self::with_strategies(store, first_match(auth_sources), first_match(expiry_sources))
    }

    fn with_strategies(store: Arc<CredentialStore>, auth: AuthCheck, expiry: ExpiryCheck) -> Self {
        Self {
            store,
            registry: StrategyRegistry::builtin(),
            auth: RwLock::new(auth),
            expiry: RwLock::new(expiry),
            injected: RwLock::new(None),
            hook: RwLock::new(None),
        }
    }

    /// Compute the current status. Never fails: any error or panic inside a
    /// signal source yields `AuthStatus::Unknown`.
    pub async fn resolve(&self) -> AuthStatus {
        // No credential means logged out, whatever the other signals claim
        if !self.store.has_credential() {
            return AuthStatus::Unauthenticated;
        }

        let ctx = self.context();
        let auth = Arc::clone(&*self.auth.read());
        let expiry = Arc::clone(&*self.expiry.read());

        match AssertUnwindSafe(Self::evaluate(ctx, auth, expiry)).catch_unwind().await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                debug!(error = %e, "Auth status resolution failed");
                AuthStatus::Unknown
            }
            Err(_) => {
                debug!("Auth status signal source panicked");
                AuthStatus::Unknown
            }
        }
    }

    async fn evaluate(ctx: SignalContext, auth: AuthCheck, expiry: ExpiryCheck) -> anyhow::Result<AuthStatus> {
        if auth(ctx.clone()).await? != Some(true) {
            return Ok(AuthStatus::Unauthenticated);
        }
        let remaining = expiry(ctx)
            .await?
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
        Ok(AuthStatus::Authenticated { remaining })
    }

    fn context(&self) -> SignalContext {
        SignalContext {
            durable: self.store.durable(),
            session: self.store.session(),
            authorization: self.store.authorization(),
            injected: self.injected.read().clone(),
            hook: self.hook.read().clone(),
        }
    }

    pub fn use_auth_strategy(&self, name: &str) -> Result<(), ConfigError> {
        let strategy = self.registry.auth(name)?;
        *self.auth.write() = strategy;
        info!(strategy = name, "Auth strategy changed");
        Ok(())
    }

    pub fn use_expiry_strategy(&self, name: &str) -> Result<(), ConfigError> {
        let strategy = self.registry.expiry(name)?;
        *self.expiry.write() = strategy;
        info!(strategy = name, "Expiry strategy changed");
        Ok(())
    }

    pub fn set_auth_strategy(&self, strategy: AuthCheck) {
        *self.auth.write() = strategy;
        info!("Auth strategy replaced");
    }

    pub fn set_expiry_strategy(&self, strategy: ExpiryCheck) {
        *self.expiry.write() = strategy;
        info!("Expiry strategy replaced");
    }

    pub fn inject_session(&self, session: Option<Arc<dyn ExternalSession>>) {
        *self.injected.write() = session;
    }

    pub fn set_custom_hook(&self, hook: Option<Arc<dyn ExternalSession>>) {
        *self.hook.write() = hook;
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::{MemoryStore, EXPIRY_KEY, TOKEN_KEY};
    use crate::navigation::LoggingNavigator;
    use chrono::Duration as ChronoDuration;

    fn store() -> (Arc<CredentialStore>, Arc<MemoryStore>, Arc<MemoryStore>) {
        let durable = Arc::new(MemoryStore::new());
        let session = Arc::new(MemoryStore::new());
        let store = CredentialStore::new(
            durable.clone(),
            Some(session.clone()),
            Arc::new(LoggingNavigator::default()),
        );
        (store, durable, session)
    }

    fn constant<T: Clone + Send + Sync + 'static>(value: Option<T>) -> SignalFn<T> {
        Arc::new(move |_: SignalContext| {
            let value = value.clone();
            async move { Ok::<_, anyhow::Error>(value) }.boxed()
        })
    }

    fn failing<T: Send + 'static>() -> SignalFn<T> {
        Arc::new(|_: SignalContext| async { Err::<Option<T>, _>(anyhow::anyhow!("source exploded")) }.boxed())
    }

    fn panicking() -> AuthCheck {
        Arc::new(|_: SignalContext| -> SignalFuture<bool> { panic!("hook bug") })
    }

    struct FixedSession {
        authenticated: Option<bool>,
        expires_at: Option<DateTime<Utc>>,
    }

    impl ExternalSession for FixedSession {
        fn is_authenticated(&self) -> BoxFuture<'_, anyhow::Result<Option<bool>>> {
            async move { Ok::<_, anyhow::Error>(self.authenticated) }.boxed()
        }

        fn expires_at(&self) -> BoxFuture<'_, anyhow::Result<Option<DateTime<Utc>>>> {
            async move { Ok::<_, anyhow::Error>(self.expires_at) }.boxed()
        }
    }

    fn remaining_secs(status: AuthStatus) -> u64 {
        match status {
            AuthStatus::Authenticated { remaining: Some(left) } => left.as_secs(),
            other => panic!("expected authenticated with expiry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_credential_is_unauthenticated_despite_signals() {
        let (store, durable, _) = store();
        durable.set(TOKEN_KEY, "stale").unwrap();

        let resolver = AuthStatusResolver::with_sources(store, vec![constant(Some(true))], vec![]);
        assert_eq!(resolver.resolve().await, AuthStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_default_chain_reports_remaining_time() {
        let (store, _, _) = store();
        store
            .set("tok", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let resolver = AuthStatusResolver::new(store);
        let secs = remaining_secs(resolver.resolve().await);
        assert!(secs > 590 && secs <= 600, "remaining was {}s", secs);
    }

    #[tokio::test]
    async fn test_first_definite_signal_wins() {
        let (store, _, _) = store();
        store
            .set("tok", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let early = Utc::now() + ChronoDuration::minutes(2);
        let late = Utc::now() + ChronoDuration::minutes(30);
        let resolver = AuthStatusResolver::with_sources(
            store,
            vec![constant(None), constant(Some(true)), failing()],
            vec![constant(None), constant(Some(early)), constant(Some(late))],
        );

        let secs = remaining_secs(resolver.resolve().await);
        assert!(secs <= 120);
    }

    #[tokio::test]
    async fn test_no_evidence_is_unauthenticated() {
        let (store, _, _) = store();
        store
            .set("tok", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let resolver = AuthStatusResolver::with_sources(store, vec![constant(None)], vec![]);
        assert_eq!(resolver.resolve().await, AuthStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_missing_expiry_is_authenticated_without_remaining() {
        let (store, _, _) = store();
        store
            .set("tok", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let resolver =
            AuthStatusResolver::with_sources(store, vec![constant(Some(true))], vec![constant(None)]);
        assert_eq!(
            resolver.resolve().await,
            AuthStatus::Authenticated { remaining: None }
        );
    }

    #[tokio::test]
    async fn test_errors_and_panics_degrade_to_unknown() {
        let (store, _, _) = store();
        store
            .set("tok", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let resolver = AuthStatusResolver::with_sources(Arc::clone(&store), vec![failing()], vec![]);
        assert_eq!(resolver.resolve().await, AuthStatus::Unknown);

        resolver.set_auth_strategy(panicking());
        assert_eq!(resolver.resolve().await, AuthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_switch_strategies_by_name() {
        let (store, durable, _) = store();
        store
            .set("tok", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();
        // Durable copy points at a different expiry than the token's payload
        let persisted = Utc::now() + ChronoDuration::minutes(3);
        durable
            .set(EXPIRY_KEY, &persisted.timestamp_millis().to_string())
            .unwrap();

        let resolver = AuthStatusResolver::new(Arc::clone(&store));
        assert!(remaining_secs(resolver.resolve().await) <= 180);

        // "jwt" finds no payload in an opaque token
        resolver.use_expiry_strategy("jwt").unwrap();
        assert_eq!(
            resolver.resolve().await,
            AuthStatus::Authenticated { remaining: None }
        );

        // Header detection sees the attached default
        resolver.use_auth_strategy("header").unwrap();
        assert!(resolver.resolve().await.is_authenticated());

        let err = resolver.use_auth_strategy("cookie").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStrategy { kind: "auth", .. }));
    }

    #[tokio::test]
    async fn test_injected_session_and_custom_hook() {
        let (store, durable, session) = store();
        store
            .set("tok", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();
        // Hide the storage signals so the chain reaches the later sources
        for scope in [&durable, &session] {
            scope.remove(TOKEN_KEY).unwrap();
            scope.remove(EXPIRY_KEY).unwrap();
        }

        let resolver = AuthStatusResolver::new(Arc::clone(&store));
        resolver.use_auth_strategy("injected").unwrap();
        assert_eq!(resolver.resolve().await, AuthStatus::Unauthenticated);

        let expiry = Utc::now() + ChronoDuration::minutes(1);
        resolver.inject_session(Some(Arc::new(FixedSession {
            authenticated: Some(true),
            expires_at: Some(expiry),
        })));
        assert!(remaining_secs(resolver.resolve().await) <= 60);

        resolver.use_auth_strategy("custom").unwrap();
        resolver.use_expiry_strategy("custom").unwrap();
        resolver.set_custom_hook(Some(Arc::new(FixedSession {
            authenticated: Some(false),
            expires_at: None,
        })));
        assert_eq!(resolver.resolve().await, AuthStatus::Unauthenticated);
    }

    #[test]
    fn test_registry_names() {
        let registry = StrategyRegistry::builtin();
        assert_eq!(
            registry.auth_names(),
            vec!["chain", "custom", "header", "injected", "persisted", "session"]
        );
        assert_eq!(
            registry.expiry_names(),
            vec!["chain", "custom", "injected", "jwt", "persisted", "session"]
        );
    }
}
