use std::fmt::Write as _;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, HeaderValue};
use http::{HeaderMap, Method, Uri};
use url::Url;

use crate::body::Body;
use crate::error::Error;
use crate::retry::RetryPolicy;
use crate::signal::CancelHandle;
use crate::util::{merge_headers, merge_pairs, parse_header_value};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

const SUPPORTED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
];

#[derive(Clone)]
pub enum Auth {
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer(String),
}

impl Auth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    pub(crate) fn header_value(&self) -> Result<HeaderValue, Error> {
        let text = match self {
            Self::Basic { username, password } => {
                let credentials = format!("{username}:{}", password.as_deref().unwrap_or_default());
                format!("Basic {}", STANDARD.encode(credentials))
            }
            Self::Bearer(token) => format!("Bearer {token}"),
        };
        let mut value = parse_header_value(AUTHORIZATION.as_str(), &text)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => formatter
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer(_) => formatter.write_str("Bearer(<redacted>)"),
        }
    }
}

/// How 3xx responses are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    follow: bool,
    max_redirects: usize,
    preserve_post: bool,
}

impl RedirectPolicy {
    pub fn none() -> Self {
        Self {
            follow: false,
            ..Self::default()
        }
    }

    pub fn limited(max_redirects: usize) -> Self {
        Self {
            max_redirects,
            ..Self::default()
        }
    }

    /// Keep POST (and its body) on 301/302 instead of switching to GET.
    pub fn preserve_post(mut self, preserve_post: bool) -> Self {
        self.preserve_post = preserve_post;
        self
    }

    pub fn follows(&self) -> bool {
        self.follow
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn preserves_post(&self) -> bool {
        self.preserve_post
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            follow: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            preserve_post: false,
        }
    }
}

/// Declarative description of one logical request.
///
/// Every field is optional so that client defaults, per-call settings and
/// session state can be layered with [`RequestConfig::merge`].
#[derive(Clone, Debug, Default)]
pub struct RequestConfig {
    pub method: Option<Method>,
    pub url: Option<String>,
    pub base_url: Option<String>,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub body: Option<Body>,
    /// Overall deadline for the logical request; zero disables it.
    pub timeout: Option<Duration>,
    pub attempt_timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub proxy: Option<String>,
    pub auth: Option<Auth>,
    pub follow_redirects: Option<bool>,
    pub max_redirects: Option<usize>,
    pub preserve_post_on_redirect: Option<bool>,
    pub max_response_body_bytes: Option<usize>,
    pub compress: Option<bool>,
    pub cancel: Option<CancelHandle>,
}

/// Validated target of a request.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestConfig {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method: Some(method),
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Layers `overrides` on top of `self`. Set fields of `overrides` win;
    /// headers, query pairs and path params merge per name.
    pub fn merge(&self, overrides: &RequestConfig) -> RequestConfig {
        RequestConfig {
            method: overrides.method.clone().or_else(|| self.method.clone()),
            url: overrides.url.clone().or_else(|| self.url.clone()),
            base_url: overrides.base_url.clone().or_else(|| self.base_url.clone()),
            headers: merge_headers(&self.headers, &overrides.headers),
            query: merge_pairs(&self.query, &overrides.query),
            params: merge_pairs(&self.params, &overrides.params),
            body: overrides.body.clone().or_else(|| self.body.clone()),
            timeout: overrides.timeout.or(self.timeout),
            attempt_timeout: overrides.attempt_timeout.or(self.attempt_timeout),
            retry: overrides.retry.clone().or_else(|| self.retry.clone()),
            proxy: overrides.proxy.clone().or_else(|| self.proxy.clone()),
            auth: overrides.auth.clone().or_else(|| self.auth.clone()),
            follow_redirects: overrides.follow_redirects.or(self.follow_redirects),
            max_redirects: overrides.max_redirects.or(self.max_redirects),
            preserve_post_on_redirect: overrides
                .preserve_post_on_redirect
                .or(self.preserve_post_on_redirect),
            max_response_body_bytes: overrides
                .max_response_body_bytes
                .or(self.max_response_body_bytes),
            compress: overrides.compress.or(self.compress),
            cancel: overrides.cancel.clone().or_else(|| self.cancel.clone()),
        }
    }

    pub fn effective_timeout(&self) -> Option<Duration> {
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        (!timeout.is_zero()).then_some(timeout)
    }

    pub fn effective_retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_else(RetryPolicy::disabled)
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        RedirectPolicy {
            follow: self.follow_redirects.unwrap_or(true),
            max_redirects: self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
            preserve_post: self.preserve_post_on_redirect.unwrap_or(false),
        }
    }

    pub fn effective_max_response_body_bytes(&self) -> usize {
        self.max_response_body_bytes
            .unwrap_or(DEFAULT_MAX_RESPONSE_BODY_BYTES)
            .max(1)
    }

    /// Resolves the target URL and authorization without side effects.
    pub fn validate(&self) -> Result<PreparedRequest, Error> {
        let method = self.method.clone().ok_or(Error::MissingMethod)?;
        if !SUPPORTED_METHODS.contains(&method) {
            return Err(Error::UnsupportedMethod { method });
        }

        let mut url = self.resolve_url()?;
        if !self.params.is_empty() {
            let path = substitute_path_params(url.path(), &self.params);
            url.set_path(&path);
        }
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(name, value)| (name, value)));
        }

        let mut headers = self.headers.clone();
        let url_auth = if url.username().is_empty() {
            None
        } else {
            Some(Auth::Basic {
                username: url.username().to_owned(),
                password: url.password().map(ToOwned::to_owned),
            })
        };
        let _ = url.set_username("");
        let _ = url.set_password(None);
        if let Some(auth) = self.auth.as_ref().or(url_auth.as_ref()) {
            headers.insert(AUTHORIZATION, auth.header_value()?);
        }

        let uri = url.as_str().parse::<Uri>().map_err(|_| Error::InvalidUri {
            uri: url.to_string(),
        })?;
        Ok(PreparedRequest {
            method,
            url,
            uri,
            headers,
        })
    }

    fn resolve_url(&self) -> Result<Url, Error> {
        let target = self.url.as_deref().unwrap_or_default();
        let url = match Url::parse(target) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let Some(base_url) = self.base_url.as_deref() else {
                    return Err(Error::InvalidUri {
                        uri: target.to_owned(),
                    });
                };
                let joined = join_base_path(base_url, target);
                Url::parse(&joined).map_err(|_| Error::InvalidUri { uri: joined })?
            }
            Err(_) => {
                return Err(Error::InvalidUri {
                    uri: target.to_owned(),
                });
            }
        };
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Error::InvalidUri {
                uri: url.to_string(),
            });
        }
        Ok(url)
    }
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

fn substitute_path_params(path: &str, params: &[(String, String)]) -> String {
    path.split('/')
        .map(|segment| {
            let name = segment
                .strip_prefix(':')
                .or_else(|| segment.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')))
                .or_else(|| {
                    segment
                        .strip_prefix("%7B")
                        .and_then(|rest| rest.strip_suffix("%7D"))
                });
            match name.and_then(|name| params.iter().find(|(key, _)| key == name)) {
                Some((_, value)) => encode_path_segment(value),
                None => segment.to_owned(),
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_path_segment(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}
