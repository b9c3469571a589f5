//! Request mediation for the backend REST API.
//!
//! Every outbound call goes through the interceptor `Pipeline`: the bearer
//! credential is attached on the way out, and on the way back the result is
//! classified as a success, a business failure embedded in a 2xx payload, or
//! a transport failure. Callers only ever see `Result<_, ApiError>`.

pub mod client;
pub mod envelope;
pub mod error;
pub mod pipeline;

pub use client::{is_valid_mac, ApiClient, ChangePasswordRequest, LoginRequest, LoginResponse, FALLBACK_MAC};
pub use envelope::{ApiEnvelope, CodeClass, CodeConvention};
pub use error::ApiError;
pub use pipeline::{LogSettings, Outcome, PerfGrade, Pipeline, RequestContext};
