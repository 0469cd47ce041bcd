use std::convert::Infallible;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::codec::StructuredCodec;
use crate::content_encoding::gzip_compress;
use crate::error::{BoxError, Error};
use crate::multipart::Form;
use crate::util::{lock_unpoisoned, parse_header_value};

/// Body type handed to a [`Connection`](crate::transport::Connection).
pub type RequestBody = BoxBody<Bytes, BoxError>;

const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Request payload.
///
/// Every variant except [`Body::Stream`] (and multipart forms holding stream
/// parts) is buffered and can be re-sent on retries and 307/308 redirects.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
    Structured(Value),
    Form(Vec<(String, String)>),
    Multipart(Form),
    Stream(StreamSource),
}

impl Body {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        serde_json::to_value(value)
            .map(Self::Structured)
            .map_err(|source| Error::Serialize { source })
    }

    pub fn form<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        let encoded =
            serde_urlencoded::to_string(value).map_err(|source| Error::SerializeForm { source })?;
        let pairs = url::form_urlencoded::parse(encoded.as_bytes())
            .into_owned()
            .collect();
        Ok(Self::Form(pairs))
    }

    pub fn form_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Form(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    pub fn stream<S, E>(stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::Stream(StreamSource::from_stream(stream, length))
    }

    pub fn reader<R>(reader: R, length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        Self::stream(ReaderStream::new(reader), length)
    }

    /// Opens `path` and streams it with its size as `Content-Length`.
    pub async fn file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let length = file.metadata().await?.len();
        Ok(Self::reader(file, Some(length)))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_replayable(&self) -> bool {
        match self {
            Self::Stream(_) => false,
            Self::Multipart(form) => form.is_replayable(),
            _ => true,
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Bytes(bytes) => write!(formatter, "Bytes({} bytes)", bytes.len()),
            Self::Text(text) => write!(formatter, "Text({} bytes)", text.len()),
            Self::Structured(_) => formatter.write_str("Structured(..)"),
            Self::Form(pairs) => write!(formatter, "Form({} pairs)", pairs.len()),
            Self::Multipart(form) => write!(formatter, "Multipart({})", form.boundary()),
            Self::Stream(source) => write!(formatter, "Stream(length={:?})", source.length()),
        }
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static [u8]> for Body {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

impl From<Form> for Body {
    fn from(value: Form) -> Self {
        Self::Multipart(value)
    }
}

/// A streaming upload source. Clones share the stream, which can be taken once.
#[derive(Clone)]
pub struct StreamSource {
    slot: Arc<Mutex<Option<RequestBody>>>,
    length: Option<u64>,
}

impl StreamSource {
    pub(crate) fn new(body: RequestBody, length: Option<u64>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(body))),
            length,
        }
    }

    pub(crate) fn from_stream<S, E>(stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::new(stream_req_body(stream), length)
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn is_consumed(&self) -> bool {
        lock_unpoisoned(&self.slot).is_none()
    }

    pub(crate) fn take(&self) -> Option<RequestBody> {
        lock_unpoisoned(&self.slot).take()
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StreamSource")
            .field("length", &self.length)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Wire form of a request body, produced once per logical request.
pub(crate) enum OutgoingBody {
    Empty,
    Buffered(Bytes),
    Streaming(StreamSource),
}

impl OutgoingBody {
    pub(crate) fn is_replayable(&self) -> bool {
        !matches!(self, Self::Streaming(_))
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Body for the next physical attempt; `None` once a stream has been sent.
    pub(crate) fn attempt_body(&self) -> Option<RequestBody> {
        match self {
            Self::Empty => Some(empty_req_body()),
            Self::Buffered(bytes) => Some(buffered_req_body(bytes.clone())),
            Self::Streaming(source) => source.take(),
        }
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

pub(crate) fn empty_req_body() -> RequestBody {
    Full::new(Bytes::new())
        .map_err(map_infallible_to_box_error)
        .boxed()
}

pub(crate) fn buffered_req_body(body: Bytes) -> RequestBody {
    Full::new(body).map_err(map_infallible_to_box_error).boxed()
}

pub(crate) fn stream_req_body<S, E>(stream: S) -> RequestBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
    E: Into<BoxError> + 'static,
{
    BodyExt::boxed(StreamBody::new(
        stream.map(|item| item.map(Frame::data).map_err(Into::<BoxError>::into)),
    ))
}

/// Turns `body` into its wire form, filling `Content-Type`, `Content-Length`
/// and `Content-Encoding` where the caller left them unset.
pub(crate) fn encode_body(
    body: &Body,
    headers: &mut HeaderMap,
    codec: &dyn StructuredCodec,
    compress: bool,
) -> Result<OutgoingBody, Error> {
    let (content_type, outgoing) = match body {
        Body::Empty => return Ok(OutgoingBody::Empty),
        Body::Bytes(bytes) => (OCTET_STREAM.to_owned(), OutgoingBody::Buffered(bytes.clone())),
        Body::Text(text) => (
            TEXT_PLAIN.to_owned(),
            OutgoingBody::Buffered(Bytes::from(text.clone())),
        ),
        Body::Structured(value) => {
            let encoded = codec
                .encode(value)
                .map_err(|source| Error::Encode { source })?;
            (
                codec.content_type().to_owned(),
                OutgoingBody::Buffered(Bytes::from(encoded)),
            )
        }
        Body::Form(pairs) => {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (name, value) in pairs {
                serializer.append_pair(name, value);
            }
            (
                FORM_URLENCODED.to_owned(),
                OutgoingBody::Buffered(Bytes::from(serializer.finish())),
            )
        }
        Body::Multipart(form) => (form.content_type(), form.encode()?),
        Body::Stream(source) => {
            let stream = source.take().ok_or(Error::StreamAlreadyConsumed)?;
            (
                OCTET_STREAM.to_owned(),
                OutgoingBody::Streaming(StreamSource::new(stream, source.length())),
            )
        }
    };

    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(
            CONTENT_TYPE,
            parse_header_value(CONTENT_TYPE.as_str(), &content_type)?,
        );
    }

    let outgoing = match outgoing {
        OutgoingBody::Buffered(bytes)
            if compress && !bytes.is_empty() && !headers.contains_key(CONTENT_ENCODING) =>
        {
            let compressed =
                gzip_compress(&bytes).map_err(|source| Error::CompressBody { source })?;
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            OutgoingBody::Buffered(compressed)
        }
        other => other,
    };

    let known_length = match &outgoing {
        OutgoingBody::Empty => None,
        OutgoingBody::Buffered(bytes) => Some(bytes.len() as u64),
        OutgoingBody::Streaming(source) => source.length(),
    };
    if let Some(length) = known_length
        && !headers.contains_key(CONTENT_LENGTH)
    {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    Ok(outgoing)
}

pub(crate) fn build_http_request(
    method: Method,
    uri: Uri,
    headers: &HeaderMap,
    body: RequestBody,
) -> Result<Request<RequestBody>, Error> {
    let mut request_builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request_builder = request_builder.header(name, value);
    }
    request_builder
        .body(body)
        .map_err(|source| Error::RequestBuild { source })
}
