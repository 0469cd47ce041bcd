use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};

use crate::codec::{JsonCodec, StructuredCodec};
use crate::config::{Auth, RedirectPolicy, RequestConfig};
use crate::engine::ClientInner;
use crate::error::Error;
use crate::proxy::{EnvProxy, NoProxyRule, ProxyConfig};
use crate::request::RequestBuilder;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::transport::{HyperTransport, TlsBackend, Transport, TransportSettings};
use crate::util::{parse_header_name, parse_header_value};

pub const DEFAULT_USER_AGENT: &str = concat!("fetchx/", env!("CARGO_PKG_VERSION"));

pub struct ClientBuilder {
    defaults: RequestConfig,
    transport_settings: TransportSettings,
    transport: Option<Arc<dyn Transport>>,
    codec: Arc<dyn StructuredCodec>,
    user_agent: String,
    cookie_store: bool,
    proxy_from_env: bool,
    no_proxy_rules: Vec<NoProxyRule>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            defaults: RequestConfig::default(),
            transport_settings: TransportSettings::default(),
            transport: None,
            codec: Arc::new(JsonCodec),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            cookie_store: true,
            proxy_from_env: true,
            no_proxy_rules: Vec::new(),
        }
    }

    /// Prefix for relative request urls.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.defaults.base_url = Some(base_url.into());
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.defaults.headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.defaults.headers = headers;
        self
    }

    /// Overall deadline per logical request. `Duration::ZERO` disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = Some(timeout);
        self
    }

    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.defaults.attempt_timeout = Some(attempt_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.defaults.retry = Some(retry_policy);
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.defaults.follow_redirects = Some(redirect_policy.follows());
        self.defaults.max_redirects = Some(redirect_policy.max_redirects());
        self.defaults.preserve_post_on_redirect = Some(redirect_policy.preserves_post());
        self
    }

    /// Proxy url used for every request unless a request sets its own.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.defaults.proxy = Some(proxy.into());
        self
    }

    /// Read `HTTP_PROXY`, `HTTPS_PROXY`, `ALL_PROXY` and `NO_PROXY` at build time.
    pub fn proxy_from_env(mut self, enabled: bool) -> Self {
        self.proxy_from_env = enabled;
        self
    }

    pub fn no_proxy<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.no_proxy_rules = rules
            .into_iter()
            .filter_map(|rule| NoProxyRule::parse(rule.as_ref()))
            .collect();
        self
    }

    pub fn add_no_proxy(mut self, rule: impl AsRef<str>) -> Self {
        if let Some(rule) = NoProxyRule::parse(rule.as_ref()) {
            self.no_proxy_rules.push(rule);
        }
        self
    }

    pub fn tls_backend(mut self, tls_backend: TlsBackend) -> Self {
        self.transport_settings.tls_backend = tls_backend;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.transport_settings.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.transport_settings.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.transport_settings.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn http2_only(mut self, http2_only: bool) -> Self {
        self.transport_settings.http2_only = http2_only;
        self
    }

    /// Replaces the hyper transport, e.g. with an in-process fake.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn codec(mut self, codec: impl StructuredCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn cookie_store(mut self, enabled: bool) -> Self {
        self.cookie_store = enabled;
        self
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.defaults.auth = Some(auth);
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.defaults.max_response_body_bytes = Some(max_response_body_bytes.max(1));
        self
    }

    /// Gzip buffered request bodies by default.
    pub fn compress(mut self, compress: bool) -> Self {
        self.defaults.compress = Some(compress);
        self
    }

    pub fn try_build(self) -> Result<Client, Error> {
        if let Some(proxy) = self.defaults.proxy.as_deref() {
            ProxyConfig::parse(proxy)?;
        }
        let user_agent = parse_header_value("user-agent", &self.user_agent)?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(self.transport_settings)?),
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                defaults: self.defaults,
                transport,
                session: Session::new(self.cookie_store),
                codec: self.codec,
                user_agent,
                env_proxy: self.proxy_from_env.then(EnvProxy::from_env),
                no_proxy_rules: self.no_proxy_rules,
            }),
        })
    }

    /// Panics when [`ClientBuilder::try_build`] fails.
    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build fetchx client: {error}"))
    }
}

/// Cheaply cloneable handle; clones share the connection pool and session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("base_url", &self.inner.defaults.base_url)
            .field("cookies", &self.inner.session.cookie_jar().len())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client with default settings. Panics if the TLS backend cannot be initialized.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn options(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::OPTIONS, url)
    }

    /// Executes a declarative request. The config is layered on top of the
    /// client defaults and the session before it is sent.
    pub async fn execute(&self, config: RequestConfig) -> Result<Response, Error> {
        self.inner.execute(config).await
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }
}
