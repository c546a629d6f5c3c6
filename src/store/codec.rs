//! Envelope encoding for stored documents.
//!
//! An envelope is the gzip-compressed JSON text of a document. Envelopes are what the
//! backends store, and what [`Store::fetch_raw`](super::Store::fetch_raw) hands out so that
//! callers can forward the compressed bytes without decoding them.

use std::{
    fmt,
    io::{BufReader, Write},
};

use bytes::Bytes;
use flate2::{Compression, bufread::GzDecoder, write::GzEncoder};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

/// Errors from encoding or decoding an [`Envelope`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CodecError {
    #[snafu(display("document cannot be serialized to JSON"))]
    Serialization { source: serde_json::Error },
    #[snafu(display("failed to compress document"))]
    Compress { source: std::io::Error },
    /// The envelope is not valid gzip, or does not hold valid JSON.
    #[snafu(display("corrupt envelope"))]
    CorruptEnvelope { source: serde_json::Error },
}

/// The compressed, serialized form of a document.
#[derive(Clone, PartialEq, Eq, derive_more::From, derive_more::Into)]
pub struct Envelope(Bytes);

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Envelope({} bytes)", self.0.len())
    }
}

impl Envelope {
    /// The raw gzip bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the envelope, returning the raw gzip bytes.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Length of the compressed envelope in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the envelope holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Envelope {
    fn from(value: Vec<u8>) -> Self {
        Self(value.into())
    }
}

impl AsRef<[u8]> for Envelope {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Serializes `document` to JSON and compresses it.
pub fn encode<T: Serialize + ?Sized>(document: &T) -> Result<Envelope, CodecError> {
    let json = serde_json::to_vec(document).context(SerializationSnafu)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json).context(CompressSnafu)?;
    let compressed = encoder.finish().context(CompressSnafu)?;
    Ok(Envelope::from(compressed))
}

/// Decompresses and parses an envelope.
///
/// The whole gzip stream is consumed, so a truncated envelope or a bad checksum is
/// reported as [`CodecError::CorruptEnvelope`].
pub fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, CodecError> {
    let reader = BufReader::new(GzDecoder::new(envelope.as_bytes()));
    serde_json::from_reader(reader).context(CorruptEnvelopeSnafu)
}
