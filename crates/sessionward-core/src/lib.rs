//! Sessionward - a client-resident session and request-mediation layer.
//!
//! This crate owns the lifetime of an authentication credential and mediates
//! every outbound API call made on behalf of the current user:
//!
//! - `auth`: credential store, auto-logout scheduler and auth status resolver
//! - `api`: interceptor pipeline, result classification and the HTTP client
//! - `navigation`: the redirect signal emitted on terminal session loss
//! - `session`: the service object wiring everything together
//! - `config`: persisted configuration with environment overrides

pub mod api;
pub mod auth;
pub mod config;
pub mod navigation;
pub mod session;
pub mod utils;

pub use api::{ApiClient, ApiError, Outcome};
pub use auth::{AuthStatus, AuthStatusResolver, Credential, CredentialStore, LogoutScheduler};
pub use config::Config;
pub use navigation::{ChannelNavigator, LoggingNavigator, NavigationEvent, Navigator};
pub use session::Session;
