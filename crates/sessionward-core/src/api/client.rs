//! API client for the session backend.
//!
//! Every call goes through the interceptor pipeline: the request stage
//! attaches the current credential, the response stage classifies the
//! result and tears the session down on a 401.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::envelope::ApiEnvelope;
use super::error::ApiError;
use super::pipeline::Pipeline;
use crate::config::Config;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

const LOGIN_PATH: &str = "/user/login";
const LOGOUT_PATH: &str = "/user/logout";
const TOKEN_PATH: &str = "/user/get-token";
const CHANGE_PASSWORD_PATH: &str = "/user/change-my-pwd";

/// Sent when the device address cannot be determined
pub const FALLBACK_MAC: &str = "00:00:00:00:00:00";

/// The local device-info service answers quickly or not at all
const MAC_LOOKUP_TIMEOUT_MS: u64 = 1200;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_id: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub new_password: String,
    pub mac_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MacLookup {
    mac_address: Option<String>,
}

/// `aa:bb:cc:dd:ee:ff`, six colon-separated hex pairs in either case
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.trim().split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// `data` of the login and token renewal envelopes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: Option<String>,
    /// Epoch milliseconds
    pub access_token_expiry: Option<i64>,
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    pipeline: Arc<Pipeline>,
    max_retries: u32,
    mac_address: Option<String>,
    mac_service_url: String,
}

impl ApiClient {
    pub fn new(config: &Config, pipeline: Arc<Pipeline>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            pipeline,
            max_retries: config.max_retries,
            mac_address: config.mac_address.clone(),
            mac_service_url: config.mac_service_url.clone(),
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Issue one call through the pipeline. Rate-limited responses are
    /// retried with exponential backoff before being classified.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut headers = HeaderMap::new();
            let ctx = self.pipeline.attach(&method, &url, &mut headers, body);

            let mut builder = self.client.request(method.clone(), &url).headers(headers);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let result = builder.send().await;

            if let Ok(response) = &result {
                if response.status() == StatusCode::TOO_MANY_REQUESTS && retries < self.max_retries {
                    retries += 1;
                    warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                    continue;
                }
            }

            return self.pipeline.complete(&ctx, result).await.into_result();
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let payload = self.request(Method::GET, path, None).await?;
        decode(path, payload)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = encode(body)?;
        let payload = self.request(Method::POST, path, Some(&body)).await?;
        decode(path, payload)
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = encode(body)?;
        let payload = self.request(Method::PATCH, path, Some(&body)).await?;
        decode(path, payload)
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<ApiEnvelope<LoginResponse>, ApiError> {
        self.post(LOGIN_PATH, request).await
    }

    pub async fn logout(&self) -> Result<ApiEnvelope<Value>, ApiError> {
        self.post(LOGOUT_PATH, &Value::Null).await
    }

    pub async fn get_token(&self) -> Result<ApiEnvelope<LoginResponse>, ApiError> {
        self.get(TOKEN_PATH).await
    }

    pub async fn change_password(&self, request: &ChangePasswordRequest) -> Result<ApiEnvelope<Value>, ApiError> {
        self.patch(CHANGE_PASSWORD_PATH, request).await
    }

    /// Device MAC address sent with login and password changes.
    ///
    /// A configured address wins; otherwise the local device-info service
    /// is asked. Anything unreachable, slow or malformed yields
    /// `FALLBACK_MAC`, never an error.
    pub async fn fetch_mac_address(&self) -> String {
        if let Some(mac) = self.mac_address.as_deref().filter(|m| is_valid_mac(m)) {
            return mac.trim().to_string();
        }

        let lookup = async {
            let response = self
                .client
                .get(&self.mac_service_url)
                .timeout(Duration::from_millis(MAC_LOOKUP_TIMEOUT_MS))
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, reqwest::Error>(response.json::<MacLookup>().await?)
        };

        match lookup.await {
            Ok(MacLookup { mac_address: Some(mac) }) if is_valid_mac(&mac) => {
                debug!(mac = %mac.trim(), "Device MAC address resolved");
                mac.trim().to_string()
            }
            Ok(_) => {
                warn!("Device MAC address invalid, using fallback");
                FALLBACK_MAC.to_string()
            }
            Err(e) => {
                warn!(error = %e, "Device MAC address lookup failed, using fallback");
                FALLBACK_MAC.to_string()
            }
        }
    }
}

fn encode<B: Serialize>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

fn decode<T: DeserializeOwned>(path: &str, payload: Value) -> Result<T, ApiError> {
    serde_json::from_value(payload)
        .map_err(|e| ApiError::InvalidResponse(format!("unexpected payload from {}: {}", path, e)))
}
