//! Request bodies
//!
//! A request body is a forward-only reader with an optional declared length
//! and an optional rewind factory. The factory lets the transport replay the
//! body when a request is retried after some of it was already sent.

use bytes::Bytes;
use std::fmt;
use std::io::{self, Cursor, Read};
use std::sync::Arc;

type Reader = Box<dyn Read + Send>;
type Rewind = Arc<dyn Fn() -> io::Result<Reader> + Send + Sync>;

/// HTTP request body
pub struct RequestBody {
    reader: Option<Reader>,
    content_length: Option<u64>,
    rewind: Option<Rewind>,
}

impl RequestBody {
    /// A body with no content
    pub fn empty() -> Self {
        RequestBody {
            reader: None,
            content_length: Some(0),
            rewind: Some(Arc::new(|| Ok(Box::new(io::empty()) as Reader))),
        }
    }

    /// An in-memory body; always rewindable
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        let len = data.len() as u64;
        let replay = data.clone();
        RequestBody {
            reader: Some(Box::new(Cursor::new(data))),
            content_length: Some(len),
            rewind: Some(Arc::new(move || Ok(Box::new(Cursor::new(replay.clone())) as Reader))),
        }
    }

    /// A streaming body with an optional declared length
    ///
    /// The transport refuses to send more bytes than a declared length.
    pub fn from_reader<R>(reader: R, content_length: Option<u64>) -> Self
    where
        R: Read + Send + 'static,
    {
        RequestBody {
            reader: Some(Box::new(reader)),
            content_length,
            rewind: None,
        }
    }

    /// A streaming body that can be recreated for retries
    pub fn rewindable<F>(content_length: Option<u64>, factory: F) -> io::Result<Self>
    where
        F: Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync + 'static,
    {
        let reader = factory()?;
        Ok(RequestBody {
            reader: Some(reader),
            content_length,
            rewind: Some(Arc::new(factory)),
        })
    }

    /// Declared length, if known
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Whether the body is known to carry no bytes
    pub fn is_empty(&self) -> bool {
        self.content_length == Some(0)
    }

    /// Whether `rewind` can recreate the body
    pub fn can_rewind(&self) -> bool {
        self.rewind.is_some()
    }

    /// Recreate the reader from the start
    pub fn rewind(&mut self) -> io::Result<()> {
        match &self.rewind {
            Some(factory) => {
                self.reader = if self.is_empty() { None } else { Some(factory()?) };
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::Unsupported, "request body cannot be rewound")),
        }
    }

    /// Whether the reader was handed out and must be rewound before reuse
    pub fn is_spent(&self) -> bool {
        self.reader.is_none() && !self.is_empty()
    }

    /// Take the reader for transmission, leaving the body spent
    pub(crate) fn take_reader(&mut self) -> Option<Reader> {
        self.reader.take()
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("content_length", &self.content_length)
            .field("rewindable", &self.can_rewind())
            .field("spent", &self.reader.is_none())
            .finish()
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Bytes> for RequestBody {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(data: &'static [u8]) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static str> for RequestBody {
    fn from(data: &'static str) -> Self {
        Self::from_bytes(data.as_bytes())
    }
}

impl From<String> for RequestBody {
    fn from(data: String) -> Self {
        Self::from_bytes(data.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(body: &mut RequestBody) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(mut r) = body.take_reader() {
            r.read_to_end(&mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_bytes_body_rewinds() {
        let mut body = RequestBody::from("hello");
        assert_eq!(body.content_length(), Some(5));
        assert_eq!(drain(&mut body), b"hello");
        assert!(body.take_reader().is_none());
        assert!(body.is_spent());

        body.rewind().unwrap();
        assert_eq!(drain(&mut body), b"hello");
    }

    #[test]
    fn test_reader_body_not_rewindable() {
        let mut body = RequestBody::from_reader(Cursor::new(vec![1u8, 2, 3]), None);
        assert!(!body.can_rewind());
        assert_eq!(drain(&mut body), vec![1, 2, 3]);
        assert!(body.rewind().is_err());
    }

    #[test]
    fn test_rewindable_factory() {
        let mut body = RequestBody::rewindable(Some(2), || Ok(Box::new(Cursor::new(b"ab".to_vec())) as _)).unwrap();
        assert_eq!(drain(&mut body), b"ab");
        body.rewind().unwrap();
        assert_eq!(drain(&mut body), b"ab");
    }

    #[test]
    fn test_empty() {
        let mut body = RequestBody::from(Vec::new());
        assert!(body.is_empty());
        assert!(body.take_reader().is_none());
        body.rewind().unwrap();
        assert!(body.take_reader().is_none());
    }
}
