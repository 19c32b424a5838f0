//! Request body compression.
use std::io;

use async_compression::{tokio::write::GzipEncoder, Level};
use bytes::Bytes;
use http::HeaderValue;
use tokio::io::AsyncWriteExt as _;

static CONTENT_ENCODING_GZIP: HeaderValue = HeaderValue::from_static("gzip");

/// Compression schemes supported for request bodies.
#[derive(Copy, Clone, Debug)]
pub enum CompressionScheme {
    /// No compression.
    Noop,

    /// Gzip.
    Gzip(Level),
}

impl CompressionScheme {
    /// No compression.
    pub const fn noop() -> Self {
        Self::Noop
    }

    /// Gzip compression, using the default compression level.
    pub const fn gzip_default() -> Self {
        Self::Gzip(Level::Default)
    }

    /// Returns gzip if `enabled` is `true`, and no compression otherwise.
    pub const fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::gzip_default()
        } else {
            Self::noop()
        }
    }

    /// Returns the value of the `Content-Encoding` header for bodies compressed with this scheme, if any.
    pub fn content_encoding(&self) -> Option<HeaderValue> {
        match self {
            Self::Noop => None,
            Self::Gzip(_) => Some(CONTENT_ENCODING_GZIP.clone()),
        }
    }

    /// Compresses `input`.
    ///
    /// # Errors
    ///
    /// If the compressor fails, an error is returned.
    pub async fn compress(&self, input: Bytes) -> io::Result<Bytes> {
        match self {
            Self::Noop => Ok(input),
            Self::Gzip(level) => {
                let mut encoder = GzipEncoder::with_quality(Vec::with_capacity(input.len() / 2), *level);
                encoder.write_all(&input).await?;
                encoder.shutdown().await?;
                Ok(Bytes::from(encoder.into_inner()))
            }
        }
    }
}
