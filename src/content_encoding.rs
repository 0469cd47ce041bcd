use std::io::{self, Read, Write};

use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Method, StatusCode};

#[derive(Debug)]
pub(crate) enum DecodeContentEncodingError {
    Decode { encoding: String, message: String },
    TooLarge { actual_bytes: usize },
}

impl DecodeContentEncodingError {
    fn decode(coding: &str, error: impl ToString) -> Self {
        Self::Decode {
            encoding: coding.to_owned(),
            message: error.to_string(),
        }
    }
}

/// A single token of a `Content-Encoding` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Coding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
}

impl Coding {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "identity" => Some(Self::Identity),
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "br" => Some(Self::Brotli),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
            Self::Zstd => "zstd",
        }
    }

    fn reader<'a>(self, body: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::Identity => Box::new(body),
            Self::Gzip => Box::new(flate2::read::MultiGzDecoder::new(body)),
            Self::Deflate => Box::new(flate2::read::ZlibDecoder::new(body)),
            Self::Brotli => Box::new(brotli::Decompressor::new(body, 4096)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(body)?),
        })
    }
}

/// Codings listed in `headers`, in the order they were applied.
fn codings(headers: &HeaderMap) -> Result<Vec<Coding>, DecodeContentEncodingError> {
    let Some(value) = headers.get(CONTENT_ENCODING) else {
        return Ok(Vec::new());
    };
    let value = value
        .to_str()
        .map_err(|error| DecodeContentEncodingError::decode("content-encoding", error))?;
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            Coding::parse(token).ok_or_else(|| {
                DecodeContentEncodingError::decode(token, "unsupported content-encoding")
            })
        })
        .collect()
}

pub(crate) fn should_decode_content_encoded_body(
    method: &Method,
    status: StatusCode,
    body_len: usize,
) -> bool {
    body_len > 0
        && *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// Undoes every coding in `Content-Encoding`, last applied first, keeping
/// each intermediate result within `max_bytes`.
pub(crate) fn decode_content_encoded_body_limited(
    body: Bytes,
    headers: &HeaderMap,
    max_bytes: usize,
) -> Result<Bytes, DecodeContentEncodingError> {
    let max_bytes = max_bytes.max(1);
    let mut decoded = body;
    for coding in codings(headers)?.into_iter().rev() {
        if coding == Coding::Identity {
            continue;
        }
        let next = {
            let mut reader = coding
                .reader(&decoded)
                .map_err(|error| DecodeContentEncodingError::decode(coding.as_str(), error))?;
            read_limited(&mut reader, coding, max_bytes)?
        };
        decoded = Bytes::from(next);
    }
    if decoded.len() > max_bytes {
        return Err(DecodeContentEncodingError::TooLarge {
            actual_bytes: decoded.len(),
        });
    }
    Ok(decoded)
}

fn read_limited(
    reader: &mut dyn Read,
    coding: Coding,
    max_bytes: usize,
) -> Result<Vec<u8>, DecodeContentEncodingError> {
    let mut output = Vec::new();
    let mut buffer = [0_u8; 8 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|error| DecodeContentEncodingError::decode(coding.as_str(), error))?;
        if read == 0 {
            return Ok(output);
        }
        let total = output.len().saturating_add(read);
        if total > max_bytes {
            return Err(DecodeContentEncodingError::TooLarge {
                actual_bytes: total,
            });
        }
        output.extend_from_slice(&buffer[..read]);
    }
}

/// Chunk-by-chunk decoder for a body with a single gzip or deflate coding.
pub(crate) enum StreamDecoder {
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
}

impl StreamDecoder {
    /// `None` when the body passes through unchanged: no coding, a coding
    /// that cannot be undone incrementally, or a response without content.
    pub(crate) fn for_response(
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Option<Self> {
        if !should_decode_content_encoded_body(method, status, 1) {
            return None;
        }
        match codings(headers).ok()?.as_slice() {
            [Coding::Gzip] => Some(Self::Gzip(flate2::write::GzDecoder::new(Vec::new()))),
            [Coding::Deflate] => Some(Self::Deflate(flate2::write::ZlibDecoder::new(Vec::new()))),
            _ => None,
        }
    }

    pub(crate) fn coding(&self) -> Coding {
        match self {
            Self::Gzip(_) => Coding::Gzip,
            Self::Deflate(_) => Coding::Deflate,
        }
    }

    /// Feeds `chunk` and returns whatever output it produced.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        let output = match self {
            Self::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                decoder.get_mut()
            }
            Self::Deflate(decoder) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                decoder.get_mut()
            }
        };
        Ok(Bytes::from(std::mem::take(output)))
    }

    pub(crate) fn finish(self) -> io::Result<Bytes> {
        let rest = match self {
            Self::Gzip(decoder) => decoder.finish()?,
            Self::Deflate(decoder) => decoder.finish()?,
        };
        Ok(Bytes::from(rest))
    }
}

pub(crate) fn gzip_compress(body: &[u8]) -> io::Result<Bytes> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(body)?;
    Ok(Bytes::from(encoder.finish()?))
}
