//! The interceptor pipeline wrapped around every outbound call.
//!
//! Request stage (`attach`) is synchronous: it copies the store's current
//! authorization header onto the request and allocates a `RequestContext`.
//! Response stage (`complete`) classifies what came back:
//!
//! - 2xx with a failure business code: `Outcome::BusinessFailure`
//! - 2xx otherwise: `Outcome::Success` with the payload untouched
//! - 401: clear the credential store, redirect, then `TransportFailure`
//! - anything else, including no response: `TransportFailure`
//!
//! Start/finish log entries are keyed by the context id and are purely
//! informational; disabling them changes nothing else.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::envelope::CodeConvention;
use super::error::ApiError;
use crate::auth::{AuthStatusResolver, CredentialStore};
use crate::utils::{format_size, truncate_string};

/// Placeholder written in place of credential-bearing header values
const MASKED: &str = "***MASKED***";

/// Response headers worth logging
const LOGGED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "cache-control",
    "etag",
    "x-ratelimit-remaining",
    "x-response-time",
];

/// One outbound call, from attach to classification.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique and increasing for the process lifetime
    pub id: u64,
    pub started_at: Instant,
    pub method: Method,
    pub url: String,
}

impl RequestContext {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { payload: Value },
    BusinessFailure { code: String, message: String },
    TransportFailure {
        status: Option<u16>,
        code: Option<String>,
        message: String,
        data: Option<Value>,
    },
}

impl Outcome {
    /// Collapse into the caller-facing result: one failure channel.
    pub fn into_result(self) -> Result<Value, ApiError> {
        match self {
            Outcome::Success { payload } => Ok(payload),
            Outcome::BusinessFailure { code, message } => Err(ApiError::Business { code, message }),
            Outcome::TransportFailure {
                status,
                code,
                message,
                data,
            } => Err(ApiError::Transport {
                status,
                code,
                message,
                data,
            }),
        }
    }
}

impl From<ApiError> for Outcome {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Business { code, message } => Outcome::BusinessFailure { code, message },
            ApiError::Transport {
                status,
                code,
                message,
                data,
            } => Outcome::TransportFailure {
                status,
                code,
                message,
                data,
            },
            other => Outcome::TransportFailure {
                status: None,
                code: None,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub enabled: bool,
    pub show_headers: bool,
    pub show_auth_status: bool,
    pub show_query_params: bool,
    pub show_response_size: bool,
    pub max_body_length: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            show_headers: true,
            show_auth_status: true,
            show_query_params: true,
            show_response_size: true,
            max_body_length: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfGrade {
    Fast,
    Normal,
    Slow,
    VerySlow,
}

impl PerfGrade {
    pub fn from_duration(elapsed: Duration) -> Self {
        match elapsed.as_millis() {
            0..=199 => PerfGrade::Fast,
            200..=499 => PerfGrade::Normal,
            500..=999 => PerfGrade::Slow,
            _ => PerfGrade::VerySlow,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PerfGrade::Fast => "FAST",
            PerfGrade::Normal => "NORMAL",
            PerfGrade::Slow => "SLOW",
            PerfGrade::VerySlow => "VERY SLOW",
        }
    }
}

/// Render headers for logging with credential-bearing values masked.
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = name.as_str().to_string();
            let value = if name.to_ascii_lowercase().contains("authorization") {
                MASKED.to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name, value)
        })
        .collect()
}

pub struct Pipeline {
    store: Arc<CredentialStore>,
    resolver: Arc<AuthStatusResolver>,
    codes: CodeConvention,
    logging: RwLock<LogSettings>,
    next_id: AtomicU64,
}

impl Pipeline {
    pub fn new(
        store: Arc<CredentialStore>,
        resolver: Arc<AuthStatusResolver>,
        codes: CodeConvention,
        logging: LogSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            codes,
            logging: RwLock::new(logging),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        self.logging.read().clone()
    }

    pub fn set_log_settings(&self, settings: LogSettings) {
        info!(?settings, "API logger settings changed");
        *self.logging.write() = settings;
    }

    pub fn codes(&self) -> &CodeConvention {
        &self.codes
    }

    /// Request stage. Attaches `Authorization: Bearer <token>` when a
    /// credential is present and opens a context for the call. `body` is
    /// only read for logging.
    pub fn attach(
        &self,
        method: &Method,
        url: &str,
        headers: &mut HeaderMap,
        body: Option<&Value>,
    ) -> RequestContext {
        match self.store.authorization() {
            Some(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            None => {
                headers.remove(AUTHORIZATION);
            }
        }

        let ctx = RequestContext {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            started_at: Instant::now(),
            method: method.clone(),
            url: url.to_string(),
        };
        self.log_start(&ctx, headers, body);
        ctx
    }

    /// Response stage for a transport result.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Outcome {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let outcome = self.classify_failure(ApiError::from_reqwest(&e));
                self.log_finish(ctx, None, &outcome, 0).await;
                return outcome;
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let outcome = self.classify_failure(ApiError::from_reqwest(&e));
                self.log_finish(ctx, Some(status), &outcome, 0).await;
                return outcome;
            }
        };

        let outcome = if status.is_success() {
            self.classify_payload(parse_body(&body))
        } else {
            self.classify_failure(ApiError::from_status(status, &body))
        };

        if self.logging.read().show_headers {
            debug!(request_id = ctx.id, headers = ?response_headers(&headers), "API response headers");
        }
        self.log_finish(ctx, Some(status), &outcome, body.len()).await;
        outcome
    }

    /// Success path: a 2xx is not enough, the payload must not carry a
    /// failure code.
    pub fn classify_payload(&self, payload: Value) -> Outcome {
        match self.codes.business_failure(&payload) {
            Some((code, message)) => Outcome::BusinessFailure { code, message },
            None => Outcome::Success { payload },
        }
    }

    /// Error path. A 401 tears the session down before the failure is
    /// handed back to the caller; other statuses mutate nothing.
    pub fn classify_failure(&self, error: ApiError) -> Outcome {
        if error.is_unauthorized() {
            warn!("Received 401, clearing credential");
            self.store.terminate();
        }
        Outcome::from(error)
    }

    fn log_start(&self, ctx: &RequestContext, headers: &HeaderMap, body: Option<&Value>) {
        let settings = self.logging.read().clone();
        if !settings.enabled {
            return;
        }

        let id = ctx.id;
        let method = ctx.method.clone();
        let url = ctx.url.clone();
        let headers = settings.show_headers.then(|| redact_headers(headers));
        let query = if settings.show_query_params {
            query_params(&url)
        } else {
            BTreeMap::new()
        };
        let body = body.map(Value::to_string).unwrap_or_default();
        let size = format_size(body.len());
        if !body.is_empty() {
            debug!(request_id = id, data = %truncate_string(&body, settings.max_body_length), "API request body");
        }

        // The request stage never suspends; annotate from a detached task
        let resolver = Arc::clone(&self.resolver);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if settings.show_auth_status => {
                handle.spawn(async move {
                    let auth = resolver.resolve().await.label();
                    info!(request_id = id, %method, %url, %size, ?query, %auth, headers = ?headers, "API request");
                });
            }
            _ => {
                info!(request_id = id, %method, %url, %size, ?query, headers = ?headers, "API request");
            }
        }
    }

    async fn log_finish(&self, ctx: &RequestContext, status: Option<StatusCode>, outcome: &Outcome, size: usize) {
        let settings = self.logging.read().clone();
        if !settings.enabled {
            return;
        }

        let elapsed = ctx.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        let grade = PerfGrade::from_duration(elapsed);
        let status = status.map(|s| s.as_u16());
        let auth = if settings.show_auth_status {
            self.resolver.resolve().await.label()
        } else {
            String::new()
        };

        match outcome {
            Outcome::Success { payload } => {
                let size = if settings.show_response_size {
                    format_size(size)
                } else {
                    String::new()
                };
                let label = grade.label();
                if grade == PerfGrade::VerySlow {
                    warn!(request_id = ctx.id, url = %ctx.url, ?status, duration_ms, grade = label, %size, %auth, "API response");
                } else {
                    info!(request_id = ctx.id, url = %ctx.url, ?status, duration_ms, grade = label, %size, %auth, "API response");
                }
                debug!(
                    request_id = ctx.id,
                    data = %truncate_string(&payload.to_string(), settings.max_body_length),
                    "API response body"
                );
            }
            Outcome::BusinessFailure { code, message } => {
                warn!(request_id = ctx.id, url = %ctx.url, ?status, duration_ms, %code, %message, %auth, "API business error");
            }
            Outcome::TransportFailure {
                status: failed,
                code,
                message,
                ..
            } => {
                warn!(request_id = ctx.id, url = %ctx.url, status = ?failed, ?code, duration_ms, %message, %auth, "API error");
            }
        }
    }
}

/// Empty bodies become `null`; non-JSON bodies are passed through as a string.
fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Query string of `url` as a sorted map; empty when there is none or the
/// url does not parse.
fn query_params(url: &str) -> BTreeMap<String, String> {
    reqwest::Url::parse(url)
        .map(|parsed| parsed.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

fn response_headers(headers: &HeaderMap) -> BTreeMap<&'static str, String> {
    LOGGED_RESPONSE_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (*name, v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::{Duration as ChronoDuration, Utc};
    use reqwest::header::{HeaderValue, CONTENT_TYPE};
    use serde_json::json;

    use crate::auth::MemoryStore;
    use crate::navigation::Navigator;

    #[derive(Default)]
    struct CountingNavigator {
        redirects: AtomicUsize,
    }

    impl Navigator for CountingNavigator {
        fn redirect_to_unauthenticated_entry(&self) {
            self.redirects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipeline() -> (Pipeline, Arc<CredentialStore>, Arc<CountingNavigator>) {
        let navigator = Arc::new(CountingNavigator::default());
        let store = CredentialStore::new(Arc::new(MemoryStore::new()), None, navigator.clone());
        let resolver = Arc::new(AuthStatusResolver::new(Arc::clone(&store)));
        let settings = LogSettings {
            enabled: false,
            ..LogSettings::default()
        };
        let pipeline = Pipeline::new(Arc::clone(&store), resolver, CodeConvention::default(), settings);
        (pipeline, store, navigator)
    }

    #[tokio::test]
    async fn test_attach_adds_bearer_and_increments_ids() {
        let (pipeline, store, _) = pipeline();
        store
            .set("tok-1", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let mut headers = HeaderMap::new();
        let first = pipeline.attach(&Method::GET, "/a", &mut headers, None);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-1");

        let second = pipeline.attach(&Method::POST, "/b", &mut HeaderMap::new(), Some(&json!({"k": 1})));
        assert!(second.id > first.id);
        assert_eq!(second.method, Method::POST);
        assert_eq!(second.url, "/b");
    }

    #[tokio::test]
    async fn test_attach_after_clear_sends_no_header() {
        let (pipeline, store, _) = pipeline();
        store
            .set("tok-1", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();
        store.clear();

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        pipeline.attach(&Method::GET, "/a", &mut headers, None);
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_business_failure_beats_transport_success() {
        let (pipeline, _, _) = pipeline();
        let outcome = pipeline.classify_payload(json!({"code": "E-123", "message": "nope"}));
        assert_eq!(
            outcome.into_result(),
            Err(ApiError::Business {
                code: "E-123".to_string(),
                message: "nope".to_string()
            })
        );
    }

    #[test]
    fn test_success_payload_is_unchanged() {
        let (pipeline, _, _) = pipeline();
        let payload = json!({"code": "S-001", "data": {"items": [1, 2, 3]}});
        let outcome = pipeline.classify_payload(payload.clone());
        assert_eq!(outcome, Outcome::Success { payload });
    }

    #[tokio::test]
    async fn test_unauthorized_clears_redirects_and_still_fails() {
        let (pipeline, store, navigator) = pipeline();
        store
            .set("tok-1", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let outcome = pipeline.classify_failure(ApiError::from_status(StatusCode::UNAUTHORIZED, ""));

        assert!(store.read().is_none());
        assert_eq!(navigator.redirects.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome,
            Outcome::TransportFailure {
                status: Some(401),
                code: None,
                message: "Unauthorized".to_string(),
                data: None,
            }
        );
    }

    #[tokio::test]
    async fn test_other_failures_leave_session_alone() {
        let (pipeline, store, navigator) = pipeline();
        store
            .set("tok-1", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let outcome = pipeline.classify_failure(ApiError::from_status(StatusCode::FORBIDDEN, "no"));

        assert!(store.read().is_some());
        assert_eq!(navigator.redirects.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.into_result().unwrap_err().status(), Some(403));
    }

    #[test]
    fn test_perf_grades() {
        assert_eq!(PerfGrade::from_duration(Duration::from_millis(20)), PerfGrade::Fast);
        assert_eq!(PerfGrade::from_duration(Duration::from_millis(200)), PerfGrade::Normal);
        assert_eq!(PerfGrade::from_duration(Duration::from_millis(999)), PerfGrade::Slow);
        assert_eq!(PerfGrade::from_duration(Duration::from_secs(3)), PerfGrade::VerySlow);
        assert_eq!(PerfGrade::VerySlow.label(), "VERY SLOW");
    }

    #[test]
    fn test_redact_headers_masks_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert("x-proxy-authorization", HeaderValue::from_static("Basic abc"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let redacted = redact_headers(&headers);
        assert_eq!(redacted["authorization"], "***MASKED***");
        assert_eq!(redacted["x-proxy-authorization"], "***MASKED***");
        assert_eq!(redacted["content-type"], "application/json");
    }

    #[tokio::test]
    async fn test_attach_with_logging_enabled_keeps_request_intact() {
        let (pipeline, store, _) = pipeline();
        pipeline.set_log_settings(LogSettings {
            show_query_params: false,
            show_response_size: false,
            ..LogSettings::default()
        });
        store
            .set("tok-1", Utc::now() + ChronoDuration::minutes(10), "alice")
            .unwrap();

        let body = json!({"newPassword": "x".repeat(5000)});
        let mut headers = HeaderMap::new();
        let ctx = pipeline.attach(&Method::PATCH, "http://h/user?x=1", &mut headers, Some(&body));

        assert_eq!(ctx.method, Method::PATCH);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-1");
        assert!(!pipeline.log_settings().show_query_params);
    }

    #[test]
    fn test_envelope_fields_survive_into_result() {
        let (pipeline, _, _) = pipeline();
        let outcome = pipeline.classify_failure(ApiError::from_status(
            StatusCode::FORBIDDEN,
            r#"{"code":"A-E005","message":"device mismatch","data":{"accountMacAddress":"AA:BB:CC:DD:EE:FF"}}"#,
        ));
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.code(), Some("A-E005"));
        assert_eq!(err.data(), Some(&json!({"accountMacAddress": "AA:BB:CC:DD:EE:FF"})));
    }

    #[test]
    fn test_query_params() {
        let query = query_params("http://localhost:8200/items?page=2&sort=name");
        assert_eq!(query["page"], "2");
        assert_eq!(query["sort"], "name");
        assert!(query_params("http://localhost:8200/items").is_empty());
        assert!(query_params("/relative?x=1").is_empty());
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_body("plain"), Value::String("plain".to_string()));
    }
}
