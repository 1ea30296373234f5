//! Broadcast hash join: the mapping relation is loaded into a lookup table,
//! the register relation is streamed past it.

use bytes::Bytes;
use fnv::FnvHashMap;
use log::{debug, info};

use crate::records::project;
use crate::sink::ResolvedSink;
use crate::utils::display_bytes;
use crate::workload::{DuplicatePolicy, JoinInputs, JoinOptions, JoinStats};
use crate::{Mapping, ResolveError};

type LookupTable = FnvHashMap<Bytes, Vec<Bytes>>;

fn build_table(
    mappings: impl Iterator<Item = Result<Mapping, ResolveError>>,
    policy: DuplicatePolicy,
    stats: &mut JoinStats,
) -> Result<LookupTable, ResolveError> {
    let mut table = LookupTable::default();
    for mapping in mappings {
        let Mapping {
            raw_url,
            canonical_url,
        } = mapping?;
        stats.mapping_records += 1;
        let canonicals = table.entry(raw_url.clone()).or_default();
        if canonicals.is_empty() || policy == DuplicatePolicy::FanOut {
            canonicals.push(canonical_url);
            continue;
        }
        if policy == DuplicatePolicy::Reject {
            return Err(ResolveError::InvariantViolation(format!(
                "raw url `{}` is mapped more than once",
                display_bytes(&raw_url)
            )));
        }
        debug!(
            "dropping duplicate mapping `{}` -> `{}`",
            display_bytes(&raw_url),
            display_bytes(&canonical_url)
        );
        stats.duplicates_dropped += 1;
    }
    Ok(table)
}

pub fn join(inputs: JoinInputs<'_>, options: &JoinOptions, sink: &mut dyn ResolvedSink) -> Result<JoinStats, ResolveError> {
    let mut stats = JoinStats::default();
    let table = build_table(inputs.mapping, options.duplicates, &mut stats)?;
    info!("broadcast table holds {} raw urls", table.len());

    for register in inputs.register {
        let register = register?;
        stats.register_records += 1;
        match table.get(&register.raw_url) {
            Some(canonicals) => {
                for canonical in canonicals {
                    sink.emit(&project(canonical, &register))?;
                    stats.resolved += 1;
                }
            }
            None => stats.unmatched += 1,
        }
    }
    Ok(stats)
}
