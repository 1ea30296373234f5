use std::io;

use thiserror::Error;

/// Why a single input line was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },
    #[error("malformed timestamp `{value}`: not a signed 64-bit decimal integer")]
    MalformedNumeric { value: String },
}

impl RecordError {
    pub(crate) fn arity(expected: &str, found: usize) -> Self {
        RecordError::MalformedRecord {
            reason: format!("expected {expected} tab-separated fields, found {found}"),
        }
    }
}

/// Error type for the resolution job.
///
/// [`ResolveError::Rejected`] is record-fatal: the record is skipped and the
/// job keeps running. Every other kind aborts the job.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("I/O failure on `{locator}`: {source}")]
    Io {
        locator: String,
        #[source]
        source: io::Error,
    },
    #[error("{relation} line {origin} rejected: {source}")]
    Rejected {
        relation: &'static str,
        origin: String,
        #[source]
        source: RecordError,
    },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("cogroup input out of order: `{next}` arrived after `{previous}`")]
    OutOfOrder { previous: String, next: String },
    #[error("invalid input pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("spill run failure: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("spill run failure: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("all {0} input records were rejected")]
    AllRecordsRejected(u64),
    #[error("job cancelled")]
    Cancelled,
}

impl ResolveError {
    pub fn io(locator: impl Into<String>, source: io::Error) -> Self {
        ResolveError::Io {
            locator: locator.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_name_relation_and_origin() {
        let rejected = ResolveError::Rejected {
            relation: "register",
            origin: "in.tsv:3".into(),
            source: RecordError::MalformedNumeric {
                value: "NaN".into(),
            },
        };
        let message = rejected.to_string();
        assert!(message.starts_with("register line in.tsv:3 rejected"));
        assert!(message.contains("`NaN`"));
    }

    #[test]
    fn io_errors_name_their_locator() {
        let err = ResolveError::io(
            "/data/mapping",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/data/mapping"));
    }
}
