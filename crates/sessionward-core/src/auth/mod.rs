//! Authentication module for managing the session credential.
//!
//! This module provides:
//! - `CredentialStore`: sole owner of the current credential
//! - `LogoutScheduler`: watchdog timer enforcing the credential's expiry
//! - `AuthStatusResolver`: answers "is the user authenticated, and for how long"
//! - `KeyValueStore` backends for durable and session-scoped persistence
//!
//! Every mutation of session state funnels through `CredentialStore::set`
//! and `CredentialStore::clear`.

pub mod credential;
pub mod resolver;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod token;

pub use credential::{AuthStatus, Credential};
pub use resolver::{AuthStatusResolver, ExternalSession, SignalContext};
pub use scheduler::{LogoutScheduler, SchedulerState};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore, StorageError};
pub use store::CredentialStore;
