//! Mock backend for integration testing
//!
//! Wraps a wiremock server with the session endpoints and builds sessions
//! that talk to it over in-memory storage.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sessionward_core::auth::MemoryStore;
use sessionward_core::{ChannelNavigator, Config, NavigationEvent, Session};
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_TOKEN: &str = "tok";
pub const TEST_USER: &str = "alice";

pub struct TestBackend {
    pub server: MockServer,
}

impl TestBackend {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn config(&self) -> Config {
        Config {
            api_base_url: self.server.uri(),
            max_retries: 2,
            mac_service_url: format!("{}/mac", self.server.uri()),
            ..Config::default()
        }
    }

    /// Session over fresh in-memory storage plus its navigation stream
    pub fn session(&self) -> (Session, UnboundedReceiver<NavigationEvent>) {
        let (navigator, events) = ChannelNavigator::new("/auth/login");
        let session = Session::with_stores(
            self.config(),
            Arc::new(MemoryStore::new()),
            Some(Arc::new(MemoryStore::new())),
            Arc::new(navigator),
        )
        .expect("session should build");
        (session, events)
    }

    /// Serve a login that issues `token` valid for `ttl`.
    pub async fn mount_login(&self, token: &str, ttl: Duration) {
        Mock::given(method("POST"))
            .and(path("/user/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(login_envelope(token, ttl)))
            .up_to_n_times(1)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_json(&self, verb: &str, route: &str, status: u16, body: Value) {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Serve the device-info lookup with `body`.
    pub async fn mount_mac(&self, body: Value) {
        self.mount_json("GET", "/mac", 200, body).await;
    }

    /// Authorization headers of every backend request received so far, in
    /// order. Device-info lookups are not backend calls and are skipped.
    pub async fn authorization_headers(&self) -> Vec<Option<String>> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() != "/mac")
            .map(|r| {
                r.headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .collect()
    }
}

pub fn login_envelope(token: &str, ttl: Duration) -> Value {
    json!({
        "status": 200,
        "code": "S-001",
        "title": "OK",
        "message": "login ok",
        "data": {
            "accessToken": token,
            "accessTokenExpiry": (Utc::now() + ttl).timestamp_millis(),
        }
    })
}

/// Count navigation events delivered so far without waiting.
pub fn drain(events: &mut UnboundedReceiver<NavigationEvent>) -> usize {
    let mut count = 0;
    while events.try_recv().is_ok() {
        count += 1;
    }
    count
}
