use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use http::Method;
use http::header::{HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;

use crate::IDEMPOTENCY_KEY_HEADER;
use crate::body::Body;
use crate::client::Client;
use crate::config::{Auth, RedirectPolicy, RequestConfig};
use crate::error::{BoxError, Error};
use crate::multipart::Form;
use crate::progress::Progress;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::signal::CancelHandle;
use crate::util::{parse_header_name, parse_header_value};

/// Fluent construction of a [`RequestConfig`] bound to a [`Client`].
pub struct RequestBuilder<'a> {
    client: &'a Client,
    config: RequestConfig,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, url: String) -> Self {
        Self {
            client,
            config: RequestConfig::new(method, url),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Marks a non-idempotent request as safe to retry.
    pub fn idempotency_key(self, key: &str) -> Result<Self, Error> {
        self.try_header(IDEMPOTENCY_KEY_HEADER, key)
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.query.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.config.query.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeQuery { source })?;
        self.config.query.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    /// Value for a `:name` or `{name}` path segment.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.params.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.config.body = Some(body.into());
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.body(Body::Text(text.into()))
    }

    pub fn json<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.body(Body::json(payload)?))
    }

    pub fn form<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.body(Body::form(payload)?))
    }

    pub fn multipart(self, form: Form) -> Self {
        self.body(Body::Multipart(form))
    }

    pub fn body_stream<S, E>(self, stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        self.body(Body::stream(stream, length))
    }

    pub fn body_reader<R>(self, reader: R, length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        self.body(Body::reader(reader, length))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.config.attempt_timeout = Some(attempt_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.config.retry = Some(retry_policy);
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.config.follow_redirects = Some(redirect_policy.follows());
        self.config.max_redirects = Some(redirect_policy.max_redirects());
        self.config.preserve_post_on_redirect = Some(redirect_policy.preserves_post());
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = Some(follow);
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.config.max_redirects = Some(max_redirects);
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.auth = Some(Auth::basic(username, password));
        self
    }

    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.config.auth = Some(Auth::bearer(token));
        self
    }

    pub fn cancel_handle(mut self, cancel: &CancelHandle) -> Self {
        self.config.cancel = Some(cancel.clone());
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.config.compress = Some(compress);
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.config.max_response_body_bytes = Some(max_response_body_bytes.max(1));
        self
    }

    pub fn into_config(self) -> RequestConfig {
        self.config
    }

    pub async fn send(self) -> Result<Response, Error> {
        self.client.execute(self.config).await
    }

    pub async fn send_json<T>(self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let mut response = self.send().await?;
        response.json().await
    }

    /// Sends the request and streams the response body into a file.
    pub async fn download(self, path: impl AsRef<Path>) -> Result<u64, Error> {
        self.download_with_progress(path, |_| {}).await
    }

    pub async fn download_with_progress<F>(
        self,
        path: impl AsRef<Path>,
        on_progress: F,
    ) -> Result<u64, Error>
    where
        F: FnMut(Progress) + Send,
    {
        let response = self.send().await?;
        let mut response = response.error_for_status().await?;
        response.download_with_progress(path, on_progress).await
    }
}
