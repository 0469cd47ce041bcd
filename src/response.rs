use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::codec::StructuredCodec;
use crate::content_encoding::{
    Coding, DecodeContentEncodingError, StreamDecoder, decode_content_encoded_body_limited,
    should_decode_content_encoded_body,
};
use crate::error::Error;
use crate::progress::Progress;
use crate::signal::{Interruption, Signal};
use crate::transport::ResponseBody;
use crate::util::truncate_body;

/// Settings a [`Response`] inherits from the logical request that produced it.
pub(crate) struct ResponseContext {
    pub(crate) url: Url,
    pub(crate) method: Method,
    pub(crate) redirect_count: usize,
    pub(crate) codec: Arc<dyn StructuredCodec>,
    pub(crate) max_body_bytes: usize,
    pub(crate) signal: Signal,
    pub(crate) timeout: Option<Duration>,
}

enum BodySlot {
    Pending(ResponseBody),
    Taken,
    Buffered(Bytes),
}

/// Final response of a logical request.
///
/// The body is read lazily and only once: either as a [`BodyStream`] through
/// [`Response::body`] (or a sink) or through the buffered accessors, which
/// memoize what they read.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: BodySlot,
    value: Option<Value>,
    context: ResponseContext,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.context.url.as_str())
            .field("redirect_count", &self.context.redirect_count)
            .field("headers", &self.headers)
            .finish()
    }
}

impl Response {
    pub(crate) fn new(response: http::Response<ResponseBody>, context: ResponseContext) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body: BodySlot::Pending(body),
            value: None,
            context,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.context.url
    }

    pub fn method(&self) -> &Method {
        &self.context.method
    }

    pub fn redirect_count(&self) -> usize {
        self.context.redirect_count
    }

    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or_default()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    /// Takes the raw body as a stream. Fails once the body has been taken or buffered.
    pub fn body(&mut self) -> Result<BodyStream, Error> {
        match std::mem::replace(&mut self.body, BodySlot::Taken) {
            BodySlot::Pending(body) => Ok(BodyStream::new(
                body,
                StreamDecoder::for_response(&self.context.method, self.status, &self.headers),
                &self.context,
            )),
            BodySlot::Buffered(bytes) => {
                self.body = BodySlot::Buffered(bytes);
                Err(Error::StreamAlreadyConsumed)
            }
            BodySlot::Taken => Err(Error::StreamAlreadyConsumed),
        }
    }

    /// Whole body, decoded from its `Content-Encoding`, read once and cached.
    pub async fn bytes(&mut self) -> Result<Bytes, Error> {
        let body = match std::mem::replace(&mut self.body, BodySlot::Taken) {
            BodySlot::Buffered(bytes) => {
                self.body = BodySlot::Buffered(bytes.clone());
                return Ok(bytes);
            }
            BodySlot::Taken => return Err(Error::StreamAlreadyConsumed),
            BodySlot::Pending(body) => body,
        };

        let max_bytes = self.context.max_body_bytes;
        let raw = match self.context.signal.run(read_all_limited(body, max_bytes)).await {
            Ok(result) => result.map_err(|error| self.read_body_error(error))?,
            Err(interruption) => return Err(interruption_error(&self.context, interruption)),
        };
        let decoded = if should_decode_content_encoded_body(
            &self.context.method,
            self.status,
            raw.len(),
        ) {
            decode_content_encoded_body_limited(raw, &self.headers, max_bytes)
                .map_err(|error| self.decode_body_error(error))?
        } else {
            raw
        };
        self.body = BodySlot::Buffered(decoded.clone());
        Ok(decoded)
    }

    /// Body as text; invalid UTF-8 sequences are replaced.
    pub async fn text(&mut self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T>(&mut self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| Error::Deserialize {
            source: Box::new(source),
            body: truncate_body(&bytes),
        })
    }

    /// Body decoded with the client's structured codec, decoded once and cached.
    pub async fn value(&mut self) -> Result<Value, Error> {
        if let Some(value) = &self.value {
            return Ok(value.clone());
        }
        let bytes = self.bytes().await?;
        let value = self
            .context
            .codec
            .decode(&bytes)
            .map_err(|source| Error::Deserialize {
                source,
                body: truncate_body(&bytes),
            })?;
        self.value = Some(value.clone());
        Ok(value)
    }

    /// Field of the decoded body at a JSON pointer such as `/user/name`;
    /// `None` when nothing lives there.
    pub async fn get(&mut self, pointer: &str) -> Result<Option<Value>, Error> {
        if self.value.is_none() {
            self.value().await?;
        }
        Ok(self
            .value
            .as_ref()
            .and_then(|value| value.pointer(pointer))
            .cloned())
    }

    /// Streams the body into `sink` without buffering it; returns the bytes written.
    pub async fn write_to<W>(&mut self, sink: &mut W) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.write_to_with_progress(sink, |_| {}).await
    }

    pub async fn write_to_with_progress<W, F>(
        &mut self,
        sink: &mut W,
        mut on_progress: F,
    ) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
        F: FnMut(Progress) + Send,
    {
        if let BodySlot::Buffered(bytes) = &self.body {
            let bytes = bytes.clone();
            sink.write_all(&bytes).await?;
            sink.flush().await?;
            let written = bytes.len() as u64;
            on_progress(Progress {
                current: written,
                total: Some(written),
            });
            return Ok(written);
        }

        let mut stream = self.body()?;
        let total = if stream.decodes() {
            None
        } else {
            self.content_length()
        };
        let mut written = 0_u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            sink.write_all(&chunk).await?;
            written = written.saturating_add(chunk.len() as u64);
            on_progress(Progress {
                current: written,
                total,
            });
        }
        sink.flush().await?;
        Ok(written)
    }

    /// Writes the body to a file at `path`, creating or truncating it.
    pub async fn download(&mut self, path: impl AsRef<Path>) -> Result<u64, Error> {
        self.download_with_progress(path, |_| {}).await
    }

    pub async fn download_with_progress<F>(
        &mut self,
        path: impl AsRef<Path>,
        on_progress: F,
    ) -> Result<u64, Error>
    where
        F: FnMut(Progress) + Send,
    {
        let mut file = tokio::fs::File::create(path.as_ref()).await?;
        let written = self.write_to_with_progress(&mut file, on_progress).await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Turns a non-2xx response into [`Error::HttpStatus`] carrying the body text.
    pub async fn error_for_status(mut self) -> Result<Self, Error> {
        if self.ok() {
            return Ok(self);
        }
        let body = match self.bytes().await {
            Ok(bytes) => truncate_body(&bytes),
            Err(_) => String::new(),
        };
        Err(Error::HttpStatus {
            status: self.status.as_u16(),
            method: self.context.method.clone(),
            uri: self.context.url.to_string(),
            body,
        })
    }

    fn read_body_error(&self, error: ReadBodyError) -> Error {
        match error {
            ReadBodyError::Read(source) => Error::ReadBody { source },
            ReadBodyError::TooLarge { actual_bytes } => self.too_large(actual_bytes),
        }
    }

    fn decode_body_error(&self, error: DecodeContentEncodingError) -> Error {
        match error {
            DecodeContentEncodingError::Decode { encoding, message } => {
                Error::DecodeContentEncoding {
                    encoding,
                    method: self.context.method.clone(),
                    uri: self.context.url.to_string(),
                    message,
                }
            }
            DecodeContentEncodingError::TooLarge { actual_bytes } => self.too_large(actual_bytes),
        }
    }

    fn too_large(&self, actual_bytes: usize) -> Error {
        Error::ResponseBodyTooLarge {
            limit_bytes: self.context.max_body_bytes,
            actual_bytes,
            method: self.context.method.clone(),
            uri: self.context.url.to_string(),
        }
    }
}

fn interruption_error(context: &ResponseContext, interruption: Interruption) -> Error {
    match interruption {
        Interruption::Cancelled => Error::Cancelled {
            method: context.method.clone(),
            uri: context.url.to_string(),
        },
        Interruption::DeadlineElapsed => Error::Timeout {
            timeout_ms: context.timeout.map(|timeout| timeout.as_millis()).unwrap_or(0),
            method: context.method.clone(),
            uri: context.url.to_string(),
        },
    }
}

enum ReadBodyError {
    Read(crate::error::BoxError),
    TooLarge { actual_bytes: usize },
}

async fn read_all_limited(mut body: ResponseBody, max_bytes: usize) -> Result<Bytes, ReadBodyError> {
    if let Some(declared) = body.size_hint().exact()
        && declared > max_bytes as u64
    {
        return Err(ReadBodyError::TooLarge {
            actual_bytes: usize::try_from(declared).unwrap_or(usize::MAX),
        });
    }

    let mut collected = Vec::new();
    let mut total_len = 0_usize;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}

/// Pull-based response body. Every poll observes the request's deadline and
/// cancellation before reading from the connection.
pub struct BodyStream {
    body: ResponseBody,
    decoder: Option<StreamDecoder>,
    interrupted: Pin<Box<dyn Future<Output = Interruption> + Send>>,
    method: Method,
    url: Url,
    timeout: Option<Duration>,
    finished: bool,
}

impl BodyStream {
    fn new(body: ResponseBody, decoder: Option<StreamDecoder>, context: &ResponseContext) -> Self {
        let signal = context.signal.clone();
        Self {
            body,
            decoder,
            interrupted: Box::pin(async move { signal.interrupted().await }),
            method: context.method.clone(),
            url: context.url.clone(),
            timeout: context.timeout,
            finished: false,
        }
    }

    /// Whether chunks are decoded from a `Content-Encoding` on the fly.
    pub fn decodes(&self) -> bool {
        self.decoder.is_some()
    }

    fn fail(&mut self, error: Error) -> Poll<Option<Result<Bytes, Error>>> {
        self.finished = true;
        Poll::Ready(Some(Err(error)))
    }

    fn decode_error(&self, coding: Coding, error: io::Error) -> Error {
        Error::DecodeContentEncoding {
            encoding: coding.as_str().to_owned(),
            method: self.method.clone(),
            uri: self.url.to_string(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BodyStream")
            .field("url", &self.url.as_str())
            .field("decodes", &self.decodes())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Poll::Ready(interruption) = this.interrupted.as_mut().poll(cx) {
            let error = match interruption {
                Interruption::Cancelled => Error::Cancelled {
                    method: this.method.clone(),
                    uri: this.url.to_string(),
                },
                Interruption::DeadlineElapsed => Error::Timeout {
                    timeout_ms: this.timeout.map(|timeout| timeout.as_millis()).unwrap_or(0),
                    method: this.method.clone(),
                    uri: this.url.to_string(),
                },
            };
            return this.fail(error);
        }

        loop {
            match Pin::new(&mut this.body).poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Err(source))) => return this.fail(Error::ReadBody { source }),
                Poll::Ready(Some(Ok(frame))) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(Some(Ok(data)));
                    };
                    match decoder.push(&data) {
                        Ok(decoded) if decoded.is_empty() => continue,
                        Ok(decoded) => return Poll::Ready(Some(Ok(decoded))),
                        Err(error) => {
                            let coding = decoder.coding();
                            let error = this.decode_error(coding, error);
                            return this.fail(error);
                        }
                    }
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    let Some(decoder) = this.decoder.take() else {
                        return Poll::Ready(None);
                    };
                    let coding = decoder.coding();
                    return match decoder.finish() {
                        Ok(rest) if rest.is_empty() => Poll::Ready(None),
                        Ok(rest) => Poll::Ready(Some(Ok(rest))),
                        Err(error) => Poll::Ready(Some(Err(this.decode_error(coding, error)))),
                    };
                }
            }
        }
    }
}
