//! Navigation signal emitted when the session ends.
//!
//! A navigator only moves the user to the unauthenticated entry point. It
//! holds no session state and never waits on in-flight requests.

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Default unauthenticated entry point
pub const DEFAULT_ENTRY_PATH: &str = "/auth/login";

pub trait Navigator: Send + Sync {
    /// Send the user to the unauthenticated entry point. Issuing it while
    /// already headed there is harmless.
    fn redirect_to_unauthenticated_entry(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    Unauthenticated { path: String },
}

/// Publishes navigation events to whoever drives the presentation layer.
pub struct ChannelNavigator {
    path: String,
    tx: mpsc::UnboundedSender<NavigationEvent>,
}

impl ChannelNavigator {
    /// Create a navigator and the receiving end of its event stream.
    pub fn new(path: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<NavigationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.into(),
                tx,
            },
            rx,
        )
    }
}

impl Navigator for ChannelNavigator {
    fn redirect_to_unauthenticated_entry(&self) {
        let event = NavigationEvent::Unauthenticated {
            path: self.path.clone(),
        };
        if self.tx.send(event).is_err() {
            // Nobody is listening anymore; nothing to navigate
            debug!(path = %self.path, "Navigation receiver dropped");
        }
    }
}

/// Navigator for headless use: records the redirect in the log only.
pub struct LoggingNavigator {
    path: String,
}

impl LoggingNavigator {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for LoggingNavigator {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_PATH)
    }
}

impl Navigator for LoggingNavigator {
    fn redirect_to_unauthenticated_entry(&self) {
        info!(path = %self.path, "Redirecting to unauthenticated entry point");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_navigator_publishes_entry_path() {
        let (navigator, mut rx) = ChannelNavigator::new("/auth/login");
        navigator.redirect_to_unauthenticated_entry();
        navigator.redirect_to_unauthenticated_entry();

        let expected = NavigationEvent::Unauthenticated {
            path: "/auth/login".to_string(),
        };
        assert_eq!(rx.try_recv().unwrap(), expected);
        assert_eq!(rx.try_recv().unwrap(), expected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_navigator_survives_dropped_receiver() {
        let (navigator, rx) = ChannelNavigator::new("/auth/login");
        drop(rx);
        navigator.redirect_to_unauthenticated_entry();
    }
}
