//! URL resolution join.
//!
//! Given a mapping relation `{rawUrl canonicalUrl}` and a register relation
//! of URL hits `{rawUrl timestamp ip}`, produce the register relation with the
//! raw URL replaced by its canonical one: `{canonicalUrl timestamp ip}`.
//!
//! The join runs either as a single-process streaming pipeline (external
//! sort-merge or broadcast hash) or as a hash-partitioned shuffle whose
//! buckets are cogrouped in parallel.

use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hasher;

pub mod error;
pub mod records;
pub mod rejects;
pub mod sink;
pub mod source;
pub mod spill;
pub mod standalone;
pub mod utils;
pub mod workload;

pub use error::{RecordError, ResolveError};

/////////////////////////////////////////////////////////////////////////////
// Relations
/////////////////////////////////////////////////////////////////////////////

/// A row of the mapping relation.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Mapping {
    pub raw_url: Bytes,
    pub canonical_url: Bytes,
}

/// A row of the register relation: one URL hit.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Register {
    pub raw_url: Bytes,
    pub timestamp: i64,
    pub ip: Bytes,
}

/// A register whose raw URL has been replaced by its canonical URL.
#[derive(Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct Resolved {
    pub canonical_url: Bytes,
    pub timestamp: i64,
    pub ip: Bytes,
}

/////////////////////////////////////////////////////////////////////////////
// Tagged records
/////////////////////////////////////////////////////////////////////////////

/// The relation a record came from.
///
/// Within a key, mapping records sort before register records.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
#[repr(u8)]
pub enum StreamTag {
    Mapping = 0,
    Register = 1,
}

impl StreamTag {
    pub fn name(self) -> &'static str {
        match self {
            StreamTag::Mapping => "mapping",
            StreamTag::Register => "register",
        }
    }
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for StreamTag {
    type Error = ResolveError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamTag::Mapping),
            1 => Ok(StreamTag::Register),
            other => Err(ResolveError::InvariantViolation(format!(
                "unknown stream tag {other}"
            ))),
        }
    }
}

/// A keyed record flowing through the shuffle.
///
/// The value of a mapping record is its canonical URL. The value of a
/// register record is the timestamp as 8 big-endian bytes followed by the ip.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct TaggedRecord {
    /// The raw URL.
    pub key: Bytes,
    /// The relation this record belongs to.
    pub tag: StreamTag,
    /// The payload.
    pub value: Bytes,
}

impl TaggedRecord {
    /// Get the key of this record.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// The total order of the merged stream: key byte-wise, then tag.
    #[inline]
    pub fn sort_key(&self) -> (&[u8], StreamTag) {
        (self.key.as_ref(), self.tag)
    }

    #[inline]
    pub fn cmp_sort_key(a: &TaggedRecord, b: &TaggedRecord) -> Ordering {
        a.sort_key().cmp(&b.sort_key())
    }

    /// Decodes the payload of a register record.
    pub fn to_register(&self) -> Result<Register, ResolveError> {
        if self.tag != StreamTag::Register || self.value.len() < 8 {
            return Err(ResolveError::InvariantViolation(format!(
                "record for `{}` does not carry a register payload",
                utils::display_bytes(&self.key)
            )));
        }
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&self.value[..8]);
        Ok(Register {
            raw_url: self.key(),
            timestamp: i64::from_be_bytes(timestamp),
            ip: self.value.slice(8..),
        })
    }
}

impl From<Mapping> for TaggedRecord {
    fn from(mapping: Mapping) -> Self {
        Self {
            key: mapping.raw_url,
            tag: StreamTag::Mapping,
            value: mapping.canonical_url,
        }
    }
}

impl From<Register> for TaggedRecord {
    fn from(register: Register) -> Self {
        let mut value = BytesMut::with_capacity(8 + register.ip.len());
        value.put_i64(register.timestamp);
        value.put(register.ip);
        Self {
            key: register.raw_url,
            tag: StreamTag::Register,
            value: value.freeze(),
        }
    }
}

/// Hashes a join key. Compute a shuffle bucket for a given key
/// by calculating `ihash(key) % n_partitions`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    (hasher.finish() & 0x7fffffff) as u32
}
