use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, PROXY_AUTHORIZATION};
use http::{Request, Response, Uri};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
#[cfg(any(feature = "tls-native", feature = "tls-rustls-ring"))]
use hyper_util::client::legacy::Client;
#[cfg(any(feature = "tls-native", feature = "tls-rustls-ring"))]
use hyper_util::rt::TokioExecutor;

#[cfg(feature = "tls-rustls-ring")]
use hyper_rustls::HttpsConnectorBuilder;

pub use crate::body::RequestBody;
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::proxy::{ProxyConfig, ProxyConnector};
use crate::signal::{Interruption, Signal};
use crate::util::lock_unpoisoned;

pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Failure reported by a [`Transport`] or [`Connection`].
#[derive(Debug)]
pub enum TransportError {
    Io {
        kind: TransportErrorKind,
        source: BoxError,
    },
    Interrupted(Interruption),
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self::Io {
            kind,
            source: source.into(),
        }
    }
}

impl From<Interruption> for TransportError {
    fn from(interruption: Interruption) -> Self {
        Self::Interrupted(interruption)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { kind, source } => write!(formatter, "{kind} error: {source}"),
            Self::Interrupted(Interruption::Cancelled) => formatter.write_str("cancelled"),
            Self::Interrupted(Interruption::DeadlineElapsed) => {
                formatter.write_str("deadline elapsed")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Opens connections to a target, optionally through a proxy.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(
        &self,
        target: &Uri,
        proxy: Option<&ProxyConfig>,
        signal: &Signal,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One request/response exchange over a dialed connection.
#[async_trait]
pub trait Connection: Send {
    async fn send(
        self: Box<Self>,
        request: Request<RequestBody>,
        signal: &Signal,
    ) -> Result<Response<ResponseBody>, TransportError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsBackend {
    RustlsRing,
    NativeTls,
}

impl TlsBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RustlsRing => "tls-rustls-ring",
            Self::NativeTls => "tls-native",
        }
    }
}

pub(crate) const fn default_tls_backend() -> TlsBackend {
    #[cfg(feature = "tls-rustls-ring")]
    {
        return TlsBackend::RustlsRing;
    }
    #[cfg(all(not(feature = "tls-rustls-ring"), feature = "tls-native"))]
    {
        return TlsBackend::NativeTls;
    }
    #[allow(unreachable_code)]
    TlsBackend::RustlsRing
}

#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub tls_backend: TlsBackend,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub http2_only: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            tls_backend: default_tls_backend(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            http2_only: false,
        }
    }
}

#[cfg(feature = "tls-rustls-ring")]
type RustlsHyperClient = Client<hyper_rustls::HttpsConnector<ProxyConnector>, RequestBody>;

#[cfg(feature = "tls-native")]
type NativeHyperClient = Client<hyper_tls::HttpsConnector<ProxyConnector>, RequestBody>;

#[derive(Clone)]
enum TransportClient {
    #[cfg(feature = "tls-rustls-ring")]
    Rustls(RustlsHyperClient),
    #[cfg(feature = "tls-native")]
    Native(NativeHyperClient),
}

impl TransportClient {
    async fn request(
        &self,
        request: Request<RequestBody>,
    ) -> Result<Response<hyper::body::Incoming>, hyper_util::client::legacy::Error> {
        match self {
            #[cfg(feature = "tls-rustls-ring")]
            Self::Rustls(client) => client.request(request).await,
            #[cfg(feature = "tls-native")]
            Self::Native(client) => client.request(request).await,
        }
    }
}

#[cfg(feature = "tls-rustls-ring")]
fn build_rustls_ring_client(
    connector: ProxyConnector,
    settings: &TransportSettings,
) -> Result<TransportClient, Error> {
    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| Error::TlsBackendInit {
            backend: TlsBackend::RustlsRing.as_str(),
            message: source.to_string(),
        })?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(connector);
    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(settings.pool_idle_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .http2_only(settings.http2_only)
        .build(https);
    Ok(TransportClient::Rustls(client))
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn build_rustls_ring_client(
    _connector: ProxyConnector,
    _settings: &TransportSettings,
) -> Result<TransportClient, Error> {
    Err(Error::TlsBackendUnavailable {
        backend: TlsBackend::RustlsRing.as_str(),
    })
}

#[cfg(feature = "tls-native")]
fn build_native_tls_client(
    connector: ProxyConnector,
    settings: &TransportSettings,
) -> Result<TransportClient, Error> {
    let https = hyper_tls::HttpsConnector::new_with_connector(connector);
    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(settings.pool_idle_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .http2_only(settings.http2_only)
        .build(https);
    Ok(TransportClient::Native(client))
}

#[cfg(not(feature = "tls-native"))]
fn build_native_tls_client(
    _connector: ProxyConnector,
    _settings: &TransportSettings,
) -> Result<TransportClient, Error> {
    Err(Error::TlsBackendUnavailable {
        backend: TlsBackend::NativeTls.as_str(),
    })
}

fn build_transport_client(
    settings: &TransportSettings,
    proxy: Option<&ProxyConfig>,
) -> Result<TransportClient, Error> {
    let connector = ProxyConnector::new(proxy, settings.connect_timeout);
    match settings.tls_backend {
        TlsBackend::RustlsRing => build_rustls_ring_client(connector, settings),
        TlsBackend::NativeTls => build_native_tls_client(connector, settings),
    }
}

/// Default [`Transport`]: one hyper-util connection pool per proxy route.
pub struct HyperTransport {
    settings: TransportSettings,
    routes: Mutex<HashMap<Option<String>, TransportClient>>,
}

impl HyperTransport {
    pub fn new(settings: TransportSettings) -> Result<Self, Error> {
        let direct = build_transport_client(&settings, None)?;
        let mut routes = HashMap::new();
        routes.insert(None, direct);
        Ok(Self {
            settings,
            routes: Mutex::new(routes),
        })
    }

    fn client_for(&self, proxy: Option<&ProxyConfig>) -> Result<TransportClient, Error> {
        let key = proxy.map(ProxyConfig::route_key);
        let mut routes = lock_unpoisoned(&self.routes);
        if let Some(client) = routes.get(&key) {
            return Ok(client.clone());
        }
        let client = build_transport_client(&self.settings, proxy)?;
        routes.insert(key, client.clone());
        Ok(client)
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("settings", &self.settings)
            .field("routes", &lock_unpoisoned(&self.routes).len())
            .finish()
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn dial(
        &self,
        target: &Uri,
        proxy: Option<&ProxyConfig>,
        signal: &Signal,
    ) -> Result<Box<dyn Connection>, TransportError> {
        signal.check()?;
        let client = self.client_for(proxy).map_err(|error| {
            TransportError::new(TransportErrorKind::Tls, error.to_string())
        })?;
        let plain_http = target
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http"));
        let proxy_authorization = proxy
            .filter(|_| plain_http)
            .and_then(|proxy| proxy.authorization().cloned());
        Ok(Box::new(HyperConnection {
            client,
            proxied: proxy.is_some(),
            proxy_authorization,
        }))
    }
}

struct HyperConnection {
    client: TransportClient,
    proxied: bool,
    proxy_authorization: Option<HeaderValue>,
}

#[async_trait]
impl Connection for HyperConnection {
    async fn send(
        self: Box<Self>,
        mut request: Request<RequestBody>,
        signal: &Signal,
    ) -> Result<Response<ResponseBody>, TransportError> {
        if let Some(authorization) = self.proxy_authorization.clone() {
            request
                .headers_mut()
                .entry(PROXY_AUTHORIZATION)
                .or_insert(authorization);
        }
        let response = signal
            .run(self.client.request(request))
            .await?
            .map_err(|error| {
                let mut kind = classify_transport_error(&error);
                if self.proxied && error.is_connect() {
                    kind = TransportErrorKind::Proxy;
                }
                TransportError::new(kind, error)
            })?;
        Ok(response.map(|body| body.map_err(|error| Box::new(error) as BoxError).boxed_unsync()))
    }
}

pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    let text = format!("{error:?}").to_ascii_lowercase();
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("write") || text.contains("broken pipe") {
        return TransportErrorKind::Write;
    }
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("unexpected eof")
        || text.contains("incomplete")
        || text.contains("closed")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}
