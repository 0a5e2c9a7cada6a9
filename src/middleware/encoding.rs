//! Value codecs and key hygiene.
//!
//! Encoded values start with a two-byte header, [`CODEC_MAGIC`] followed by a
//! codec tag. Values without a header are returned as stored, so data written
//! before a codec was configured stays readable. Reads decode whatever header
//! they find, independent of the codec configured for writes.
//!
//! The identity codec writes most values as they are, but a value that itself
//! begins with [`CODEC_MAGIC`] gets an identity header so it can never be
//! mistaken for an encoded one.

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::physical::{
    effective_transaction_limits, Backend, Entry, Operation, ToggleablePurgemonster,
    Transactional, TransactionalLimits, TxnEntry,
};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// First byte of every encoded value.
pub const CODEC_MAGIC: u8 = 0x00;

const TAG_IDENTITY: u8 = b'I';
const TAG_GZIP: u8 = b'G';
const TAG_MD5: u8 = b'M';
const MD5_LEN: usize = 16;

/// Worst-case bytes gzip adds to a value of up to a default transaction
/// budget: header, gzip framing and stored-block markers.
const GZIP_OVERHEAD: usize = 64;

/// Codec applied to values on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Identity,
    Gzip,
    /// Stores an MD5 digest with the value and verifies it on read.
    Md5,
}

impl Codec {
    pub fn from_name(name: &str) -> PhysicalResult<Self> {
        match name {
            "" | "identity" => Ok(Self::Identity),
            "gzip" => Ok(Self::Gzip),
            "md5" => Ok(Self::Md5),
            other => Err(PhysicalError::config(
                "codec",
                format!("unknown codec {}", other),
            )),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Md5 => "md5",
        }
    }

    /// Upper bound on the bytes [`Codec::encode`] adds to one value.
    pub fn overhead(self) -> usize {
        match self {
            Self::Identity => 2,
            Self::Gzip => GZIP_OVERHEAD,
            Self::Md5 => 2 + MD5_LEN,
        }
    }

    pub fn encode(self, value: &[u8]) -> PhysicalResult<Vec<u8>> {
        match self {
            Self::Identity if value.first() == Some(&CODEC_MAGIC) => {
                let mut out = Vec::with_capacity(2 + value.len());
                out.extend_from_slice(&[CODEC_MAGIC, TAG_IDENTITY]);
                out.extend_from_slice(value);
                Ok(out)
            }
            Self::Identity => Ok(value.to_vec()),
            Self::Gzip => {
                let mut out = vec![CODEC_MAGIC, TAG_GZIP];
                let mut encoder = GzEncoder::new(&mut out, Compression::default());
                encoder.write_all(value)?;
                encoder.finish()?;
                Ok(out)
            }
            Self::Md5 => {
                let digest = md5::compute(value);
                let mut out = Vec::with_capacity(2 + MD5_LEN + value.len());
                out.extend_from_slice(&[CODEC_MAGIC, TAG_MD5]);
                out.extend_from_slice(&digest.0);
                out.extend_from_slice(value);
                Ok(out)
            }
        }
    }
}

/// Decode a stored value by its header.
pub fn decode(key: &str, stored: &[u8]) -> PhysicalResult<Vec<u8>> {
    match stored {
        [CODEC_MAGIC, TAG_IDENTITY, body @ ..] => Ok(body.to_vec()),
        [CODEC_MAGIC, TAG_GZIP, body @ ..] => {
            let mut out = Vec::new();
            GzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| PhysicalError::backend_from(&format!("gzip decode {}", key), e))?;
            Ok(out)
        }
        [CODEC_MAGIC, TAG_MD5, rest @ ..] if rest.len() >= MD5_LEN => {
            let (digest, body) = rest.split_at(MD5_LEN);
            if md5::compute(body).0[..] != *digest {
                return Err(PhysicalError::ChecksumMismatch {
                    key: key.to_string(),
                });
            }
            Ok(body.to_vec())
        }
        _ => Ok(stored.to_vec()),
    }
}

fn is_printable(c: char) -> bool {
    c == ' ' || !(c.is_control() || c.is_whitespace())
}

fn check_key(key: &str) -> PhysicalResult<()> {
    if key.chars().all(is_printable) {
        Ok(())
    } else {
        Err(PhysicalError::NonPrintableKey {
            key: key.to_string(),
        })
    }
}

/// Applies a [`Codec`] to values and refuses non-printable keys on writes.
#[derive(Debug)]
pub struct Encoding<B> {
    inner: B,
    codec: Codec,
}

impl<B: Backend> Encoding<B> {
    pub fn new(inner: B, codec: Codec) -> Self {
        Self { inner, codec }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    fn decode_entry(&self, mut entry: Entry) -> PhysicalResult<Entry> {
        entry.value = decode(&entry.key, &entry.value)?;
        Ok(entry)
    }
}

#[async_trait]
impl<B: Backend> Backend for Encoding<B> {
    async fn put(&self, ctx: &Context, mut entry: Entry) -> PhysicalResult<()> {
        check_key(&entry.key)?;
        entry.value = self.codec.encode(&entry.value)?;
        self.inner.put(ctx, entry).await
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        match self.inner.get(ctx, key).await? {
            Some(entry) => self.decode_entry(entry).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        check_key(key)?;
        self.inner.delete(ctx, key).await
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        self.inner.list(ctx, prefix).await
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        self.inner
            .as_transactional()
            .map(|_| self as &dyn Transactional)
    }

    fn as_transaction_limits(&self) -> Option<&dyn TransactionalLimits> {
        Some(self)
    }

    fn as_purgeable(&self) -> Option<&dyn ToggleablePurgemonster> {
        self.inner.as_purgeable()
    }
}

/// Inner limits with the byte budget reduced by the codec's per-entry
/// overhead, so a transaction that fits here still fits once encoded.
impl<B: Backend> TransactionalLimits for Encoding<B> {
    fn transaction_limits(&self) -> (usize, usize) {
        match self.inner.as_transaction_limits() {
            Some(limits) => {
                let (entries, size) = effective_transaction_limits(limits.transaction_limits());
                let reserved = entries.saturating_mul(self.codec.overhead());
                (entries, size.saturating_sub(reserved).max(1))
            }
            None => (0, 0),
        }
    }
}

#[async_trait]
impl<B: Backend> Transactional for Encoding<B> {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let inner = self
            .inner
            .as_transactional()
            .ok_or_else(|| PhysicalError::unsupported("transaction"))?;

        let mut encoded = Vec::with_capacity(txns.len());
        for txn in txns.iter() {
            let mut copy = txn.clone();
            match txn.operation {
                Operation::Put => {
                    check_key(&txn.entry.key)?;
                    copy.entry.value = self.codec.encode(&txn.entry.value)?;
                }
                Operation::Delete => check_key(&txn.entry.key)?,
                Operation::Get | Operation::List => {}
            }
            encoded.push(copy);
        }

        inner.transaction(ctx, &mut encoded).await?;

        for (txn, done) in txns.iter_mut().zip(encoded) {
            if txn.operation == Operation::Get {
                txn.entry.value = decode(&txn.entry.key, &done.entry.value)?;
            }
        }
        Ok(())
    }
}
