//! Line parsers for the two input relations and the output line format.
//!
//! Fields are separated by a single TAB. Trailing empty fields are dropped
//! before the arity check, so `a.com\t1\t` has two fields, not three.

use std::fmt::Write;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Mapping, RecordError, Register, Resolved};

pub const FIELD_DELIMITER: u8 = b'\t';

/// Splits a line on TAB, dropping trailing empty fields.
///
/// The returned fields share the line's buffer.
pub fn split_fields(line: &Bytes) -> Vec<Bytes> {
    let mut fields = Vec::with_capacity(3);
    let mut start = 0;
    for (i, byte) in line.iter().enumerate() {
        if *byte == FIELD_DELIMITER {
            fields.push(line.slice(start..i));
            start = i + 1;
        }
    }
    fields.push(line.slice(start..));
    while fields.len() > 1 && fields.last().is_some_and(Bytes::is_empty) {
        fields.pop();
    }
    fields
}

/// Parses `rawUrl\tcanonicalUrl`. Fields past the second are ignored.
pub fn parse_mapping(line: &Bytes) -> Result<Mapping, RecordError> {
    if line.is_empty() {
        return Err(RecordError::MalformedRecord {
            reason: "empty line".into(),
        });
    }
    let mut fields = split_fields(line).into_iter();
    match (fields.next(), fields.next()) {
        (Some(raw_url), Some(canonical_url)) if !canonical_url.is_empty() => Ok(Mapping {
            raw_url,
            canonical_url,
        }),
        (Some(_), Some(_)) => Err(RecordError::MalformedRecord {
            reason: "empty canonical url".into(),
        }),
        _ => Err(RecordError::arity("at least 2", 1)),
    }
}

/// Parses `rawUrl\ttimestamp\tip`.
pub fn parse_register(line: &Bytes) -> Result<Register, RecordError> {
    let fields = split_fields(line);
    let [raw_url, timestamp, ip]: [Bytes; 3] = fields
        .try_into()
        .map_err(|fields: Vec<Bytes>| RecordError::arity("3", fields.len()))?;
    Ok(Register {
        raw_url,
        timestamp: parse_timestamp(&timestamp)?,
        ip,
    })
}

fn parse_timestamp(field: &[u8]) -> Result<i64, RecordError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RecordError::MalformedNumeric {
            value: String::from_utf8_lossy(field).into_owned(),
        })
}

/// Builds an output row from a mapping payload and a register.
#[inline]
pub fn project(canonical_url: &Bytes, register: &Register) -> Resolved {
    Resolved {
        canonical_url: canonical_url.clone(),
        timestamp: register.timestamp,
        ip: register.ip.clone(),
    }
}

impl Resolved {
    /// Appends `canonicalUrl\ttimestamp\tip\n` to `buf`.
    pub fn write_line(&self, buf: &mut BytesMut) {
        buf.put(self.canonical_url.as_ref());
        buf.put_u8(FIELD_DELIMITER);
        // BytesMut grows on demand; formatting into it cannot fail.
        let _ = write!(buf, "{}", self.timestamp);
        buf.put_u8(FIELD_DELIMITER);
        buf.put(self.ip.as_ref());
        buf.put_u8(b'\n');
    }
}
