//! Input mappings.
//!
//! A mapping entry selects a piece of a source node's samples into the
//! path-local signal vector: a data range, a header field, a timestamp or a
//! statistics aggregate. Entries are written as strings in the path `in`
//! list, e.g. `src.data[3-7]` or `src.stats.owd.mean`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sample::Sample;
use crate::signal::{Signal, SignalData, SignalList, SignalType};
use crate::stats::{Aggregate, Metric, Stats};
use crate::timing::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampField {
    Origin,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingKind {
    /// `node.data[off]` / `node.data[a-b]`.
    Data { offset: usize, length: usize },
    /// Bare `node`: the whole data vector, length resolved against the
    /// source signal list.
    FullData,
    /// `node.ts.origin` / `node.ts.received`: two integer slots (sec, nsec).
    Timestamp(TimestampField),
    /// `node.hdr.sequence`: one integer slot.
    Sequence,
    /// `node.stats.<metric>.<aggregate>`: one float slot.
    Stats { metric: Metric, aggregate: Aggregate },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub node: String,
    pub kind: MappingKind,
}

impl MappingEntry {
    /// Parse a full entry: node name, optionally followed by a field
    /// selector.
    pub fn parse(s: &str) -> Result<MappingEntry> {
        if s.is_empty() {
            return Err(Error::config("empty mapping entry"));
        }

        match s.split_once('.') {
            None => Ok(MappingEntry {
                node: s.to_string(),
                kind: MappingKind::FullData,
            }),
            Some((node, rest)) => {
                if node.is_empty() {
                    return Err(Error::config(format!("mapping entry '{}' has no node", s)));
                }
                Ok(MappingEntry {
                    node: node.to_string(),
                    kind: parse_field(rest)?,
                })
            }
        }
    }

    /// Number of slots this entry occupies in the path signal vector.
    /// `FullData` must be resolved against the source first.
    pub fn slot_count(&self) -> Option<usize> {
        match &self.kind {
            MappingKind::Data { length, .. } => Some(*length),
            MappingKind::FullData => None,
            MappingKind::Timestamp(_) => Some(2),
            MappingKind::Sequence => Some(1),
            MappingKind::Stats { .. } => Some(1),
        }
    }
}

/// Parse the selector after the node name.
pub fn parse_field(rest: &str) -> Result<MappingKind> {
    let err = |msg: &str| Err(Error::config(format!("mapping '{}': {}", rest, msg)));

    if let Some(ts) = rest.strip_prefix("ts.") {
        return match ts {
            "origin" => Ok(MappingKind::Timestamp(TimestampField::Origin)),
            "received" => Ok(MappingKind::Timestamp(TimestampField::Received)),
            _ => err("unknown timestamp field"),
        };
    }

    if let Some(hdr) = rest.strip_prefix("hdr.") {
        return match hdr {
            "sequence" => Ok(MappingKind::Sequence),
            _ => err("unknown header field"),
        };
    }

    if let Some(stats) = rest.strip_prefix("stats.") {
        let (metric, aggregate) = match stats.split_once('.') {
            Some(pair) => pair,
            None => return err("stats mapping needs metric and aggregate"),
        };
        return Ok(MappingKind::Stats {
            metric: Metric::from_str(metric)?,
            aggregate: Aggregate::from_str(aggregate)?,
        });
    }

    if let Some(idx) = rest.strip_prefix("data[") {
        let close = match idx.find(']') {
            Some(p) => p,
            None => return err("unterminated data index"),
        };
        if !idx[close + 1..].is_empty() {
            return err("trailing characters after data index");
        }

        let body = &idx[..close];
        if body.is_empty() {
            return err("empty data index");
        }

        let (offset, length) = match body.split_once('-') {
            None => {
                let off = body
                    .parse::<usize>()
                    .map_err(|_| Error::config(format!("mapping '{}': bad index", rest)))?;
                (off, 1)
            }
            Some((a, b)) => {
                let a = a
                    .parse::<usize>()
                    .map_err(|_| Error::config(format!("mapping '{}': bad range start", rest)))?;
                let b = b
                    .parse::<usize>()
                    .map_err(|_| Error::config(format!("mapping '{}': bad range end", rest)))?;
                if b < a {
                    return err("negative range length");
                }
                (a, b - a + 1)
            }
        };

        return Ok(MappingKind::Data { offset, length });
    }

    err("unknown mapping field")
}

/// A mapping entry bound to a source index and a span of the path signal
/// vector.
#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    pub kind: MappingKind,
    pub source_index: usize,
    pub target_offset: usize,
    pub length: usize,
}

impl ResolvedMapping {
    /// Write this entry's slots into `out`. `src` is the latest sample from
    /// the bound source, if any arrived yet; missing values fall back to the
    /// target signal's initial value and count a warning.
    pub fn apply(
        &self,
        out: &mut Sample,
        src: Option<&Sample>,
        stats: Option<&Stats>,
        path_signals: &SignalList,
        missing_warnings: &AtomicU64,
    ) {
        let t = self.target_offset;

        match &self.kind {
            MappingKind::Data { offset, length } => {
                self.apply_data(out, src, path_signals, missing_warnings, *offset, *length);
            }
            MappingKind::FullData => {
                self.apply_data(out, src, path_signals, missing_warnings, 0, self.length);
            }
            MappingKind::Timestamp(field) => {
                let ts = src.map(|s| match field {
                    TimestampField::Origin => s.ts_origin,
                    TimestampField::Received => s.ts_received,
                });
                let ts = ts.unwrap_or_else(Timestamp::default);
                let data = out.data_mut();
                data[t] = SignalData::integer(ts.sec);
                data[t + 1] = SignalData::integer(ts.nsec as i64);
            }
            MappingKind::Sequence => {
                let seq = src.map(|s| s.sequence).unwrap_or(0);
                out.data_mut()[t] = SignalData::integer(seq as i64);
            }
            MappingKind::Stats { metric, aggregate } => {
                let v = stats
                    .map(|s| s.aggregate(*metric, *aggregate))
                    .unwrap_or(0.0);
                out.data_mut()[t] = SignalData::float(v);
            }
        }
    }

    fn apply_data(
        &self,
        out: &mut Sample,
        src: Option<&Sample>,
        path_signals: &SignalList,
        missing_warnings: &AtomicU64,
        offset: usize,
        length: usize,
    ) {
        for i in 0..length {
            let target_sig = &path_signals[self.target_offset + i];

            let value = src.and_then(|s| {
                if offset + i < s.len() {
                    let src_ty = s
                        .signals
                        .as_ref()
                        .and_then(|sigs| sigs.get(offset + i))
                        .map(|sig| sig.ty)
                        .unwrap_or(target_sig.ty);
                    Some(s.data()[offset + i].cast(src_ty, target_sig.ty))
                } else {
                    None
                }
            });

            let value = match value {
                Some(v) => v,
                None => {
                    missing_warnings.fetch_add(1, Ordering::Relaxed);
                    target_sig.init
                }
            };

            out.data_mut()[self.target_offset + i] = value;
        }
    }
}

/// Derive the signal descriptor(s) an entry contributes to the path signal
/// vector.
pub fn mapped_signals(entry: &MappingEntry, source_signals: &SignalList) -> Vec<Arc<Signal>> {
    match &entry.kind {
        MappingKind::Data { offset, length } => (*offset..offset + length)
            .map(|i| match source_signals.get(i) {
                Some(sig) => Arc::clone(sig),
                None => Arc::new(Signal::new(
                    format!("{}.data[{}]", entry.node, i),
                    SignalType::Float,
                )),
            })
            .collect(),
        MappingKind::FullData => source_signals.iter().map(Arc::clone).collect(),
        MappingKind::Timestamp(field) => {
            let which = match field {
                TimestampField::Origin => "origin",
                TimestampField::Received => "received",
            };
            vec![
                Arc::new(Signal::new(
                    format!("{}.ts.{}.sec", entry.node, which),
                    SignalType::Integer,
                )),
                Arc::new(Signal::new(
                    format!("{}.ts.{}.nsec", entry.node, which),
                    SignalType::Integer,
                )),
            ]
        }
        MappingKind::Sequence => vec![Arc::new(Signal::new(
            format!("{}.hdr.sequence", entry.node),
            SignalType::Integer,
        ))],
        MappingKind::Stats { metric, .. } => vec![Arc::new(Signal::new(
            format!("{}.stats.{}", entry.node, metric.as_str()),
            SignalType::Float,
        ))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        assert_eq!(
            parse_field("ts.origin").unwrap(),
            MappingKind::Timestamp(TimestampField::Origin)
        );
        assert_eq!(
            parse_field("ts.received").unwrap(),
            MappingKind::Timestamp(TimestampField::Received)
        );
        assert_eq!(parse_field("hdr.sequence").unwrap(), MappingKind::Sequence);

        assert_eq!(
            parse_field("stats.owd.mean").unwrap(),
            MappingKind::Stats {
                metric: Metric::Owd,
                aggregate: Aggregate::Mean
            }
        );

        assert_eq!(
            parse_field("data[1-2]").unwrap(),
            MappingKind::Data {
                offset: 1,
                length: 2
            }
        );
        assert_eq!(
            parse_field("data[5-5]").unwrap(),
            MappingKind::Data {
                offset: 5,
                length: 1
            }
        );
        assert_eq!(
            parse_field("data[22]").unwrap(),
            MappingKind::Data {
                offset: 22,
                length: 1
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_field("data[]").is_err());
        assert!(parse_field("data[1.1-2f]").is_err());
        assert!(parse_field("data").is_err());
        assert!(parse_field("stats.owd").is_err());
        assert!(parse_field("hdr.sequences").is_err());
        assert!(parse_field("stats.ts.origin.bla").is_err());
        assert!(parse_field("stats.ts.origin.").is_err());
        assert!(parse_field("data[1-2]bla").is_err());
        assert!(parse_field("data[5-3]").is_err());
    }

    #[test]
    fn test_parse_entry() {
        let e = MappingEntry::parse("src.data[0-3]").unwrap();
        assert_eq!(e.node, "src");
        assert_eq!(e.slot_count(), Some(4));

        let e = MappingEntry::parse("src").unwrap();
        assert_eq!(e.kind, MappingKind::FullData);
        assert_eq!(e.slot_count(), None);

        assert!(MappingEntry::parse("").is_err());
    }

    #[test]
    fn test_apply_data_with_cast_and_fill() {
        use crate::pool::{MemoryType, Pool};
        use crate::signal::signal_list_generate;

        let pool = Pool::new(4, 8, MemoryType::Heap).unwrap();

        // Source carries two integers; the path expects three floats.
        let src_signals = signal_list_generate(2, SignalType::Integer);
        let path_signals = signal_list_generate(3, SignalType::Float);

        let mut src = pool.alloc_one().unwrap();
        {
            let s = src.as_mut();
            s.signals = Some(src_signals);
            s.set_len(2);
            s.data_mut()[0] = SignalData::integer(7);
            s.data_mut()[1] = SignalData::integer(9);
        }

        let mut out = pool.alloc_one().unwrap();
        out.as_mut().set_len(3);

        let m = ResolvedMapping {
            kind: MappingKind::Data {
                offset: 0,
                length: 3,
            },
            source_index: 0,
            target_offset: 0,
            length: 3,
        };

        let warnings = AtomicU64::new(0);
        m.apply(out.as_mut(), Some(&*src), None, &path_signals, &warnings);

        assert_eq!(out.data()[0].f(), 7.0);
        assert_eq!(out.data()[1].f(), 9.0);
        // Third slot was missing upstream: filled from init, warned once.
        assert_eq!(out.data()[2].f(), 0.0);
        assert_eq!(warnings.load(Ordering::Relaxed), 1);
    }
}
