//! Response envelope and the business-code convention.
//!
//! The backend wraps every payload as `{ status, code, title, message, data }`
//! and multiplexes domain success and failure onto 2xx responses: a code
//! starting with the failure prefix (`E-` by default) is a domain error even
//! though the transport succeeded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default prefix marking a domain failure
const FAILURE_PREFIX: &str = "E-";

/// Default prefix marking a domain success
const SUCCESS_PREFIX: &str = "S-";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiEnvelope<T> {
    pub status: u16,
    pub code: String,
    pub title: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> Default for ApiEnvelope<T> {
    fn default() -> Self {
        Self {
            status: 0,
            code: String::new(),
            title: String::new(),
            message: String::new(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeClass {
    Success,
    Failure,
    /// Neither prefix; treated as success by the pipeline
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeConvention {
    pub failure_prefix: String,
    pub success_prefix: String,
}

impl Default for CodeConvention {
    fn default() -> Self {
        Self {
            failure_prefix: FAILURE_PREFIX.to_string(),
            success_prefix: SUCCESS_PREFIX.to_string(),
        }
    }
}

impl CodeConvention {
    pub fn classify(&self, code: &str) -> CodeClass {
        if !self.failure_prefix.is_empty() && code.starts_with(&self.failure_prefix) {
            CodeClass::Failure
        } else if !self.success_prefix.is_empty() && code.starts_with(&self.success_prefix) {
            CodeClass::Success
        } else {
            CodeClass::Neutral
        }
    }

    /// Extract `(code, message)` when a payload reports a domain failure.
    /// Payloads that are not objects, or carry no string `code`, pass.
    pub fn business_failure(&self, payload: &Value) -> Option<(String, String)> {
        let code = payload.get("code")?.as_str()?;
        if self.classify(code) != CodeClass::Failure {
            return None;
        }
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((code.to_string(), message))
    }
}
