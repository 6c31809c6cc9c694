//! Postcard codec for length-delimited framing with serde serialization.
//!
//! Combines [`LengthDelimitedCodec`] with postcard so typed frames can be
//! read and written with `FramedRead`/`FramedWrite`. The read side and the
//! write side of a connection each get their own codec instance, typed for
//! the direction's message.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const MAX_FRAME: usize = 4 * 1024 * 1024;

/// A codec that combines length-delimited framing with postcard
/// serialization for any type implementing `Serialize`/`Deserialize`.
#[derive(Debug)]
pub struct PostcardCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<T>,
}

impl<T> Clone for PostcardCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Default for PostcardCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PostcardCodec<T> {
    /// Create a new postcard codec with a 4 MiB max frame length.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<T> Decoder for PostcardCodec<T>
where
    T: for<'de> Deserialize<'de>,
{
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = postcard::from_bytes(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T> Encoder<T> for PostcardCodec<T>
where
    T: Serialize,
{
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = postcard::to_allocvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Request, Verb};

    #[test]
    fn encode_decode_request() {
        let mut codec = PostcardCodec::<Request>::new();
        let req = Request {
            path: Some("/a/b".to_owned()),
            value: Some(Bytes::from_static(b"hello")),
            rev: Some(3),
            ..Request::new(7, Verb::Set)
        };

        let mut buf = BytesMut::new();
        codec.encode(req.clone(), &mut buf).unwrap();
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_decodes_none() {
        let mut codec = PostcardCodec::<Request>::new();
        let mut buf = BytesMut::new();
        codec.encode(Request::new(1, Verb::Rev), &mut buf).unwrap();
        let full = buf.len();
        let mut partial = buf.split_to(full - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
