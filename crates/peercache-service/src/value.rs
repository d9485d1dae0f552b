use std::fmt;

use bytes::Bytes;

/// An immutable view over a cached value.
///
/// The underlying buffer is never handed out mutably. Construction from a borrowed slice always
/// copies, so neither the loader that produced the bytes nor any later holder can alter what is
/// stored in a cache.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteView {
    bytes: Bytes,
}

impl ByteView {
    /// Creates a view over a fresh copy of `data`.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(data),
        }
    }

    /// The length of the value in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns a copy of the data as an owned byte vector.
    pub fn byte_slice(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// Borrows the data.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the data as a string, replacing invalid UTF-8 sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Returns a cheap, reference-counted handle to the data, e.g. to write it into a response
    /// body.
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl From<Bytes> for ByteView {
    /// Takes ownership of a buffer received from elsewhere, e.g. a peer response body.
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteView")
            .field("len", &self.len())
            .finish()
    }
}
