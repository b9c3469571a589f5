use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// The single failure channel surfaced to API callers.
///
/// Business and transport failures stay distinguishable by variant so
/// callers can branch on them, but both arrive as `Err`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Non-2xx status, or no response at all (`status: None`). `code` and
    /// `data` come from the error envelope when the server sent one.
    #[error("Request failed ({}): {message}", status_label(.status))]
    Transport {
        status: Option<u16>,
        code: Option<String>,
        message: String,
        data: Option<Value>,
    },

    /// 2xx response whose payload carries a failure code.
    #[error("Business error {code}: {message}")]
    Business { code: String, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no response".to_string(),
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        crate::utils::truncate_string(body, MAX_ERROR_BODY_LENGTH)
    }

    /// Build a transport failure from a non-2xx response body. The message
    /// prefers the envelope's `message`, then the raw text, then the reason
    /// phrase; the envelope's `code` and `data` are carried along.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let envelope = serde_json::from_str::<Value>(body).ok().filter(Value::is_object);
        let field = |name: &str| {
            envelope
                .as_ref()
                .and_then(|v| v.get(name))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let message = match field("message") {
            Some(message) => message,
            None if !body.trim().is_empty() => Self::truncate_body(body.trim()),
            None => status.canonical_reason().unwrap_or("Unknown status").to_string(),
        };

        ApiError::Transport {
            status: Some(status.as_u16()),
            code: field("code"),
            message,
            data: envelope
                .as_ref()
                .and_then(|v| v.get("data"))
                .filter(|d| !d.is_null())
                .cloned(),
        }
    }

    /// Connection failures, timeouts and other errors raised before a
    /// response could be read.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            format!("request timed out: {}", error)
        } else if error.is_connect() {
            format!("connection failed: {}", error)
        } else {
            error.to_string()
        };
        ApiError::Transport {
            status: error.status().map(|s| s.as_u16()),
            code: None,
            message,
            data: None,
        }
    }

    /// Transport status, when the failure came with one
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Transport { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED.as_u16())
    }

    /// Business code, for failures embedded in a 2xx payload
    pub fn business_code(&self) -> Option<&str> {
        match self {
            ApiError::Business { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Server code from either a business failure or an error envelope
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Business { code, .. } => Some(code),
            ApiError::Transport { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// `data` of the error envelope, e.g. the registered device of a
    /// device-mismatch rejection
    pub fn data(&self) -> Option<&Value> {
        match self {
            ApiError::Transport { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::Transport { message, .. } | ApiError::Business { message, .. } => message,
            ApiError::InvalidRequest(message) | ApiError::InvalidResponse(message) => message,
        }
    }
}
