use http::Method;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Proxy,
    Read,
    Write,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Proxy => "proxy",
            Self::Read => "read",
            Self::Write => "write",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Coarse failure class of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Encoding,
    Decoding,
    Network,
    Timeout,
    Cancelled,
    Proxy,
    Redirect,
    TooManyRedirects,
    MaxRetriesExceeded,
    StreamAlreadyConsumed,
    HttpStatus,
    Io,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    MissingMethod,
    UnsupportedMethod,
    InvalidHeaderName,
    InvalidHeaderValue,
    TlsBackendUnavailable,
    TlsBackendInit,
    RequestBuild,
    SerializeJson,
    SerializeQuery,
    SerializeForm,
    Encode,
    CompressBody,
    ReadBody,
    ResponseBodyTooLarge,
    Deserialize,
    DecodeContentEncoding,
    Transport,
    AttemptTimeout,
    Timeout,
    Cancelled,
    InvalidProxy,
    ProxyConnect,
    MissingRedirectLocation,
    InvalidRedirectLocation,
    RedirectBodyNotReplayable,
    TooManyRedirects,
    MaxRetriesExceeded,
    RetryableStatus,
    StreamAlreadyConsumed,
    HttpStatus,
    Io,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::MissingMethod => "missing_method",
            Self::UnsupportedMethod => "unsupported_method",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::TlsBackendUnavailable => "tls_backend_unavailable",
            Self::TlsBackendInit => "tls_backend_init",
            Self::RequestBuild => "request_build",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::Encode => "encode",
            Self::CompressBody => "compress_body",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Deserialize => "deserialize",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::Transport => "transport",
            Self::AttemptTimeout => "attempt_timeout",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidProxy => "invalid_proxy",
            Self::ProxyConnect => "proxy_connect",
            Self::MissingRedirectLocation => "missing_redirect_location",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectBodyNotReplayable => "redirect_body_not_replayable",
            Self::TooManyRedirects => "too_many_redirects",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::RetryableStatus => "retryable_status",
            Self::StreamAlreadyConsumed => "stream_already_consumed",
            Self::HttpStatus => "http_status",
            Self::Io => "io",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("request method is missing")]
    MissingMethod,
    #[error("unsupported request method: {method}")]
    UnsupportedMethod { method: Method },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("tls backend {backend} is not compiled in")]
    TlsBackendUnavailable { backend: &'static str },
    #[error("failed to initialize tls backend {backend}: {message}")]
    TlsBackendInit {
        backend: &'static str,
        message: String,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to encode structured request body: {source}")]
    Encode {
        #[source]
        source: BoxError,
    },
    #[error("failed to compress request body: {source}")]
    CompressBody {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to decode structured response body: {source}; body={body}")]
    Deserialize {
        #[source]
        source: BoxError,
        body: String,
    },
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http attempt timed out after {timeout_ms}ms for {method} {uri}")]
    AttemptTimeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http request deadline exceeded after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("invalid proxy {proxy}: {message}")]
    InvalidProxy { proxy: String, message: String },
    #[error("proxy {proxy} failed for {method} {uri}: {source}")]
    ProxyConnect {
        proxy: String,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("redirect response {status} missing location header for {method} {uri}")]
    MissingRedirectLocation {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("cannot follow redirect for non-replayable request body: {method} {uri}")]
    RedirectBodyNotReplayable { method: Method, uri: String },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    TooManyRedirects {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("giving up after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("retryable status {status} for {method} {uri}")]
    RetryableStatus {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("response body stream was already consumed")]
    StreamAlreadyConsumed,
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("i/o error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::MissingMethod => ErrorCode::MissingMethod,
            Self::UnsupportedMethod { .. } => ErrorCode::UnsupportedMethod,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::TlsBackendUnavailable { .. } => ErrorCode::TlsBackendUnavailable,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::Encode { .. } => ErrorCode::Encode,
            Self::CompressBody { .. } => ErrorCode::CompressBody,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::AttemptTimeout { .. } => ErrorCode::AttemptTimeout,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::InvalidProxy { .. } => ErrorCode::InvalidProxy,
            Self::ProxyConnect { .. } => ErrorCode::ProxyConnect,
            Self::MissingRedirectLocation { .. } => ErrorCode::MissingRedirectLocation,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::RedirectBodyNotReplayable { .. } => ErrorCode::RedirectBodyNotReplayable,
            Self::TooManyRedirects { .. } => ErrorCode::TooManyRedirects,
            Self::MaxRetriesExceeded { .. } => ErrorCode::MaxRetriesExceeded,
            Self::RetryableStatus { .. } => ErrorCode::RetryableStatus,
            Self::StreamAlreadyConsumed => ErrorCode::StreamAlreadyConsumed,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUri { .. }
            | Self::MissingMethod
            | Self::UnsupportedMethod { .. }
            | Self::InvalidHeaderName { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::TlsBackendUnavailable { .. }
            | Self::TlsBackendInit { .. }
            | Self::RequestBuild { .. } => ErrorKind::Config,
            Self::Serialize { .. }
            | Self::SerializeQuery { .. }
            | Self::SerializeForm { .. }
            | Self::Encode { .. }
            | Self::CompressBody { .. } => ErrorKind::Encoding,
            Self::ResponseBodyTooLarge { .. }
            | Self::Deserialize { .. }
            | Self::DecodeContentEncoding { .. } => ErrorKind::Decoding,
            Self::Transport { .. } | Self::ReadBody { .. } => ErrorKind::Network,
            Self::AttemptTimeout { .. } | Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::InvalidProxy { .. } | Self::ProxyConnect { .. } => ErrorKind::Proxy,
            Self::MissingRedirectLocation { .. }
            | Self::InvalidRedirectLocation { .. }
            | Self::RedirectBodyNotReplayable { .. } => ErrorKind::Redirect,
            Self::TooManyRedirects { .. } => ErrorKind::TooManyRedirects,
            Self::MaxRetriesExceeded { .. } => ErrorKind::MaxRetriesExceeded,
            Self::StreamAlreadyConsumed => ErrorKind::StreamAlreadyConsumed,
            Self::RetryableStatus { .. } | Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Status code carried by status-derived errors, looking through retry exhaustion.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RetryableStatus { status, .. } | Self::HttpStatus { status, .. } => Some(*status),
            Self::MaxRetriesExceeded { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}
