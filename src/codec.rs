//! Page codecs.
//!
//! The exchange never looks inside a page; producers and consumers agree on
//! a [`PageCodec`] to turn typed batches into page bytes and back.
//! [`BincodeCodec`] is the stock implementation: a one-byte header carrying
//! flags, then a bincode body, optionally LZ4 compressed.

use crate::error::{ExchangeError, Result};
use crate::page::Page;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

const FLAG_LZ4: u8 = 1 << 0;

/// Encode/decode boundary between typed batches and opaque pages.
pub trait PageCodec: Send + Sync {
    type Batch;

    fn encode(&self, batch: &Self::Batch) -> Result<Page>;

    fn decode(&self, page: &Page) -> Result<Self::Batch>;
}

/// Serde-based codec for any serializable batch type.
#[derive(Debug)]
pub struct BincodeCodec<T> {
    compress: bool,
    _batch: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            compress: false,
            _batch: PhantomData,
        }
    }

    /// Compress page bodies with LZ4. Needs the `lz4` feature.
    pub fn compressed(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PageCodec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    type Batch = T;

    fn encode(&self, batch: &T) -> Result<Page> {
        let body = bincode::serialize(batch).map_err(|e| ExchangeError::Codec(e.to_string()))?;

        let (flags, body) = if self.compress {
            (FLAG_LZ4, compress(&body)?)
        } else {
            (0, body)
        };

        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(flags);
        buf.put_slice(&body);
        Ok(Page::new(buf.freeze()))
    }

    fn decode(&self, page: &Page) -> Result<T> {
        let data: &Bytes = page.data();
        let Some((&flags, body)) = data.split_first() else {
            return Err(ExchangeError::Codec("empty page".to_string()));
        };

        let decoded;
        let body = if flags & FLAG_LZ4 != 0 {
            decoded = decompress(body)?;
            &decoded[..]
        } else {
            body
        };

        bincode::deserialize(body).map_err(|e| ExchangeError::Codec(e.to_string()))
    }
}

#[cfg(feature = "lz4")]
fn compress(body: &[u8]) -> Result<Vec<u8>> {
    Ok(lz4_flex::compress_prepend_size(body))
}

#[cfg(feature = "lz4")]
fn decompress(body: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(body).map_err(|e| ExchangeError::Codec(e.to_string()))
}

#[cfg(not(feature = "lz4"))]
fn compress(_body: &[u8]) -> Result<Vec<u8>> {
    Err(ExchangeError::Codec(
        "lz4 compression requested but the lz4 feature is disabled".to_string(),
    ))
}

#[cfg(not(feature = "lz4"))]
fn decompress(_body: &[u8]) -> Result<Vec<u8>> {
    Err(ExchangeError::Codec(
        "page is lz4 compressed but the lz4 feature is disabled".to_string(),
    ))
}
