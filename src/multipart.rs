use std::path::Path;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::{StreamExt, stream};
use http_body_util::BodyExt;
use rand::RngExt;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::body::{OutgoingBody, StreamSource};
use crate::error::{BoxError, Error};

type PartStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + Sync>>;

/// `multipart/form-data` body made of text fields and file or stream parts.
#[derive(Clone, Debug)]
pub struct Form {
    boundary: String,
    fields: Vec<(String, Part)>,
}

#[derive(Clone, Debug)]
pub struct Part {
    content: PartContent,
    file_name: Option<String>,
    mime: Option<String>,
}

#[derive(Clone, Debug)]
enum PartContent {
    Buffered(Bytes),
    Stream(StreamSource),
}

impl Default for Form {
    fn default() -> Self {
        Self::new()
    }
}

impl Form {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let high = rng.random_range(0..u64::MAX);
        let low = rng.random_range(0..u64::MAX);
        Self {
            boundary: format!("{high:016x}{low:016x}"),
            fields: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.part(name, Part::text(value))
    }

    pub fn part(mut self, name: impl Into<String>, part: Part) -> Self {
        self.fields.push((name.into(), part));
        self
    }

    /// Adds the file at `path` as a streamed part named after the file.
    pub async fn file(self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, Error> {
        let part = Part::file(path).await?;
        Ok(self.part(name, part))
    }

    pub(crate) fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub(crate) fn is_replayable(&self) -> bool {
        self.fields
            .iter()
            .all(|(_, part)| matches!(part.content, PartContent::Buffered(_)))
    }

    /// Total encoded size when every part length is known.
    pub fn content_length(&self) -> Option<u64> {
        let mut total = 0_u64;
        for (name, part) in &self.fields {
            total = total
                .checked_add(part.header_block(&self.boundary, name).len() as u64)?
                .checked_add(part.length()?)?
                .checked_add(2)?;
        }
        total.checked_add(self.closing_delimiter().len() as u64)
    }

    fn closing_delimiter(&self) -> Bytes {
        Bytes::from(format!("--{}--\r\n", self.boundary))
    }

    pub(crate) fn encode(&self) -> Result<OutgoingBody, Error> {
        if self.is_replayable() {
            let mut buffer = BytesMut::new();
            for (name, part) in &self.fields {
                buffer.extend_from_slice(&part.header_block(&self.boundary, name));
                if let PartContent::Buffered(bytes) = &part.content {
                    buffer.extend_from_slice(bytes);
                }
                buffer.extend_from_slice(b"\r\n");
            }
            buffer.extend_from_slice(&self.closing_delimiter());
            return Ok(OutgoingBody::Buffered(buffer.freeze()));
        }

        let length = self.content_length();
        let mut segments: Vec<PartStream> = Vec::with_capacity(self.fields.len() * 3 + 1);
        for (name, part) in &self.fields {
            segments.push(single(part.header_block(&self.boundary, name)));
            match &part.content {
                PartContent::Buffered(bytes) => segments.push(single(bytes.clone())),
                PartContent::Stream(source) => {
                    let body = source.take().ok_or(Error::StreamAlreadyConsumed)?;
                    segments.push(Box::pin(body.into_data_stream()));
                }
            }
            segments.push(single(Bytes::from_static(b"\r\n")));
        }
        segments.push(single(self.closing_delimiter()));

        Ok(OutgoingBody::Streaming(StreamSource::from_stream(
            stream::iter(segments).flatten(),
            length,
        )))
    }
}

fn single(bytes: Bytes) -> PartStream {
    Box::pin(stream::once(futures_util::future::ready(Ok(bytes))))
}

impl Part {
    pub fn text(value: impl Into<String>) -> Self {
        Self::buffered(Bytes::from(value.into()))
    }

    pub fn bytes(value: impl Into<Bytes>) -> Self {
        Self::buffered(value.into())
    }

    pub fn stream<S, E>(stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            content: PartContent::Stream(StreamSource::from_stream(stream, length)),
            file_name: None,
            mime: None,
        }
    }

    pub fn reader<R>(reader: R, length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        Self::stream(ReaderStream::new(reader), length)
    }

    pub async fn file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let mut part = Self::reader(file, Some(length)).mime("application/octet-stream");
        if let Some(file_name) = path.file_name().and_then(|name| name.to_str()) {
            part = part.file_name(file_name);
        }
        Ok(part)
    }

    fn buffered(bytes: Bytes) -> Self {
        Self {
            content: PartContent::Buffered(bytes),
            file_name: None,
            mime: None,
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    fn length(&self) -> Option<u64> {
        match &self.content {
            PartContent::Buffered(bytes) => Some(bytes.len() as u64),
            PartContent::Stream(source) => source.length(),
        }
    }

    fn header_block(&self, boundary: &str, name: &str) -> Bytes {
        let mut block = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"",
            escape_quoted(name)
        );
        if let Some(file_name) = &self.file_name {
            block.push_str(&format!("; filename=\"{}\"", escape_quoted(file_name)));
        }
        block.push_str("\r\n");
        if let Some(mime) = &self.mime {
            block.push_str(&format!("Content-Type: {mime}\r\n"));
        }
        block.push_str("\r\n");
        Bytes::from(block)
    }
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
