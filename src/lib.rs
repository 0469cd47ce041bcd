//! `fetchx` is a fetch-style async HTTP client with HTTP/1.1 + HTTP/2 support.
//!
//! One logical request may span several physical attempts (retries) and hops
//! (redirects), all bounded by a single deadline and an optional
//! [`CancelHandle`]. Cookies and runtime default headers live in the client's
//! [`Session`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use fetchx::prelude::{Client, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct CreateItemResponse {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")
//!         .timeout(Duration::from_secs(8))
//!         .attempt_timeout(Duration::from_secs(3))
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .max_attempts(3)
//!                 .exponential_backoff(Duration::from_millis(100), Duration::from_millis(800)),
//!         )
//!         .try_build()?;
//!
//!     let created: CreateItemResponse = client
//!         .post("/v1/items")
//!         .idempotency_key("create-item-001")?
//!         .json(&serde_json::json!({ "name": "demo" }))?
//!         .send_json()
//!         .await?;
//!
//!     println!("created id={}", created.id);
//!     Ok(())
//! }
//! ```
//!
//! # Defaults
//!
//! - 60s overall timeout, no retries, up to 10 redirects, 8 MiB buffered bodies.
//! - Proxies come from `HTTP_PROXY`/`HTTPS_PROXY`/`ALL_PROXY` unless disabled.
//! - Retries only cover idempotent methods or requests with an `Idempotency-Key`.

#[cfg(all(not(feature = "tls-rustls-ring"), not(feature = "tls-native")))]
compile_error!("fetchx requires one TLS backend feature: enable `tls-rustls-ring` or `tls-native`");

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

mod body;
mod client;
mod codec;
mod config;
mod content_encoding;
mod cookie;
mod engine;
mod error;
mod multipart;
mod orchestrator;
mod progress;
mod proxy;
mod request;
mod response;
mod retry;
mod session;
mod signal;
pub mod transport;
mod util;

pub use crate::body::{Body, StreamSource};
pub use crate::client::{Client, ClientBuilder, DEFAULT_USER_AGENT};
pub use crate::codec::{JsonCodec, StructuredCodec};
pub use crate::config::{
    Auth, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RESPONSE_BODY_BYTES, DEFAULT_TIMEOUT,
    PreparedRequest, RedirectPolicy, RequestConfig,
};
pub use crate::cookie::{Cookie, CookieJar};
pub use crate::error::{BoxError, Error, ErrorCode, ErrorKind, TransportErrorKind};
pub use crate::multipart::{Form, Part};
pub use crate::progress::Progress;
pub use crate::proxy::{ProxyConfig, ProxyScheme};
pub use crate::request::RequestBuilder;
pub use crate::response::{BodyStream, Response};
pub use crate::retry::{Backoff, RetryCause, RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::session::Session;
pub use crate::signal::{CancelHandle, Interruption, Signal};
pub use crate::transport::TlsBackend;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Auth, Body, BodyStream, CancelHandle, Client, ClientBuilder, Error, ErrorCode, ErrorKind,
        Form, Part, Progress, RedirectPolicy, RequestConfig, Response, Result, RetryPolicy,
        TlsBackend,
    };
}

#[cfg(test)]
mod tests;
