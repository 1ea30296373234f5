//! Per-key cogroup over a stream sorted by `(key, tag)`.
//!
//! Each key group runs `Seek -> CollectMapping -> EmitRegisters -> Seek`.
//! Only the canonical URL(s) of the current key and one register are held at
//! any time, so registers of a hot key are never materialized.

use bytes::Bytes;
use log::debug;

use crate::records::project;
use crate::sink::ResolvedSink;
use crate::utils::display_bytes;
use crate::workload::{DuplicatePolicy, JoinStats};
use crate::{ResolveError, StreamTag, TaggedRecord};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum GroupState {
    Seek,
    CollectMapping,
    EmitRegisters,
}

pub struct CoGroup<'s> {
    policy: DuplicatePolicy,
    state: GroupState,
    key: Option<Bytes>,
    last_tag: StreamTag,
    canonicals: Vec<Bytes>,
    stats: &'s mut JoinStats,
}

impl<'s> CoGroup<'s> {
    pub fn new(policy: DuplicatePolicy, stats: &'s mut JoinStats) -> Self {
        Self {
            policy,
            state: GroupState::Seek,
            key: None,
            last_tag: StreamTag::Mapping,
            canonicals: Vec::with_capacity(1),
            stats,
        }
    }

    fn out_of_order(&self, record: &TaggedRecord) -> ResolveError {
        let previous = self.key.as_deref().unwrap_or_default();
        ResolveError::OutOfOrder {
            previous: format!("{}/{}", display_bytes(previous), self.last_tag),
            next: format!("{}/{}", display_bytes(&record.key), record.tag),
        }
    }

    /// Feeds the next record of the sorted stream.
    pub fn push(&mut self, record: TaggedRecord, sink: &mut dyn ResolvedSink) -> Result<(), ResolveError> {
        match &self.key {
            Some(key) if *key == record.key => {
                if record.tag < self.last_tag {
                    return Err(self.out_of_order(&record));
                }
            }
            Some(key) if key[..] > record.key[..] => {
                return Err(self.out_of_order(&record));
            }
            _ => {
                self.state = GroupState::Seek;
                self.canonicals.clear();
                self.key = Some(record.key());
            }
        }
        self.last_tag = record.tag;

        match record.tag {
            StreamTag::Mapping => {
                self.stats.mapping_records += 1;
                self.collect_mapping(record)
            }
            StreamTag::Register => {
                self.stats.register_records += 1;
                self.state = GroupState::EmitRegisters;
                self.emit_register(&record, sink)
            }
        }
    }

    fn collect_mapping(&mut self, record: TaggedRecord) -> Result<(), ResolveError> {
        debug_assert_ne!(self.state, GroupState::EmitRegisters);
        self.state = GroupState::CollectMapping;
        if self.canonicals.is_empty() {
            self.canonicals.push(record.value);
            return Ok(());
        }
        match self.policy {
            DuplicatePolicy::Reject => Err(ResolveError::InvariantViolation(format!(
                "raw url `{}` is mapped more than once",
                display_bytes(&record.key)
            ))),
            DuplicatePolicy::FirstWins => {
                debug!(
                    "dropping duplicate mapping `{}` -> `{}`",
                    display_bytes(&record.key),
                    display_bytes(&record.value)
                );
                self.stats.duplicates_dropped += 1;
                Ok(())
            }
            DuplicatePolicy::FanOut => {
                self.canonicals.push(record.value);
                Ok(())
            }
        }
    }

    fn emit_register(&mut self, record: &TaggedRecord, sink: &mut dyn ResolvedSink) -> Result<(), ResolveError> {
        if self.canonicals.is_empty() {
            self.stats.unmatched += 1;
            return Ok(());
        }
        let register = record.to_register()?;
        for canonical in &self.canonicals {
            sink.emit(&project(canonical, &register))?;
            self.stats.resolved += 1;
        }
        Ok(())
    }
}

/// Runs the cogroup over a whole sorted stream.
pub fn cogroup<I>(
    records: I,
    policy: DuplicatePolicy,
    sink: &mut dyn ResolvedSink,
    stats: &mut JoinStats,
) -> Result<(), ResolveError>
where
    I: IntoIterator<Item = Result<TaggedRecord, ResolveError>>,
{
    let mut group = CoGroup::new(policy, stats);
    for record in records {
        group.push(record?, sink)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mapping, Register, Resolved};

    fn mapping(raw: &'static str, canonical: &'static str) -> TaggedRecord {
        TaggedRecord::from(Mapping {
            raw_url: Bytes::from_static(raw.as_bytes()),
            canonical_url: Bytes::from_static(canonical.as_bytes()),
        })
    }

    fn register(raw: &'static str, timestamp: i64, ip: &'static str) -> TaggedRecord {
        TaggedRecord::from(Register {
            raw_url: Bytes::from_static(raw.as_bytes()),
            timestamp,
            ip: Bytes::from_static(ip.as_bytes()),
        })
    }

    fn run(records: Vec<TaggedRecord>, policy: DuplicatePolicy) -> Result<(Vec<Resolved>, JoinStats), ResolveError> {
        let mut out: Vec<Resolved> = Vec::new();
        let mut stats = JoinStats::default();
        cogroup(records.into_iter().map(Ok), policy, &mut out, &mut stats)?;
        Ok((out, stats))
    }

    fn canonicals(rows: &[Resolved]) -> Vec<&[u8]> {
        rows.iter().map(|r| r.canonical_url.as_ref()).collect()
    }

    #[test]
    fn resolves_and_drops_orphans() {
        let (rows, stats) = run(
            vec![
                mapping("a.com", "A"),
                register("a.com", 1, "X"),
                register("a.com", 3, "Z"),
                register("z.com", 2, "Y"),
            ],
            DuplicatePolicy::Reject,
        )
        .unwrap();
        assert_eq!(canonicals(&rows), vec![&b"A"[..], &b"A"[..]]);
        assert_eq!(rows[1].timestamp, 3);
        assert_eq!(stats.resolved, 2);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.mapping_records, 1);
        assert_eq!(stats.register_records, 3);
    }

    #[test]
    fn mapping_without_registers_emits_nothing() {
        let (rows, _) = run(
            vec![mapping("a.com", "A"), mapping("b.com", "B"), register("c.com", 1, "ip")],
            DuplicatePolicy::Reject,
        )
        .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn canonical_does_not_leak_into_next_key() {
        let (rows, stats) = run(
            vec![mapping("a", "A"), register("b", 1, "ip")],
            DuplicatePolicy::Reject,
        )
        .unwrap();
        assert!(rows.is_empty());
        assert_eq!(stats.unmatched, 1);
    }

    #[test]
    fn empty_key_is_grouped_like_any_other() {
        let (rows, _) = run(
            vec![mapping("", "EMPTY"), register("", 9, "ip")],
            DuplicatePolicy::Reject,
        )
        .unwrap();
        assert_eq!(canonicals(&rows), vec![&b"EMPTY"[..]]);
    }

    #[test]
    fn duplicate_mapping_policies() {
        let records = || {
            vec![
                mapping("a", "FIRST"),
                mapping("a", "SECOND"),
                register("a", 1, "ip"),
            ]
        };
        assert!(matches!(
            run(records(), DuplicatePolicy::Reject),
            Err(ResolveError::InvariantViolation(_))
        ));

        let (rows, stats) = run(records(), DuplicatePolicy::FirstWins).unwrap();
        assert_eq!(canonicals(&rows), vec![&b"FIRST"[..]]);
        assert_eq!(stats.duplicates_dropped, 1);

        let (rows, stats) = run(records(), DuplicatePolicy::FanOut).unwrap();
        assert_eq!(canonicals(&rows), vec![&b"FIRST"[..], &b"SECOND"[..]]);
        assert_eq!(stats.resolved, 2);
    }

    #[test]
    fn regressing_key_is_job_fatal() {
        let err = run(
            vec![register("b", 1, "ip"), mapping("a", "A")],
            DuplicatePolicy::Reject,
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::OutOfOrder { .. }));
    }

    #[test]
    fn mapping_after_register_of_same_key_is_job_fatal() {
        let err = run(
            vec![register("a", 1, "ip"), mapping("a", "A")],
            DuplicatePolicy::Reject,
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::OutOfOrder { .. }));
    }
}
