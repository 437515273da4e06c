//! Human-readable line format.
//!
//! One sample per line:
//!
//! ```text
//! SECONDS.NANOSECONDS[+OFFSET][(SEQUENCE)]\tVALUE1\tVALUE2...\n
//! ```
//!
//! Only the seconds field is mandatory when scanning; the offset reconstructs
//! the receive timestamp relative to the origin.

use std::fmt::Write as _;

use crate::error::{Result, WireError};
use crate::format::Format;
use crate::sample::{flags, Sample, SampleRef};
use crate::signal::{SignalData, SignalList};
use crate::timing::Timestamp;

pub struct HumanFormat {
    signals: SignalList,
    mask: u32,
    separator: char,
    delimiter: char,
}

impl HumanFormat {
    pub fn new(signals: SignalList) -> Self {
        HumanFormat {
            signals,
            mask: flags::HAS_TS_ORIGIN | flags::HAS_OFFSET | flags::HAS_SEQUENCE | flags::HAS_DATA,
            separator: '\t',
            delimiter: '\n',
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    /// Render one sample as a line, including the trailing delimiter.
    pub fn print_single(&self, smp: &Sample) -> String {
        let mut line = String::new();

        if self.mask & flags::HAS_TS_ORIGIN != 0 {
            if smp.flags & flags::HAS_TS_ORIGIN != 0 {
                let _ = write!(line, "{}.{:09}", smp.ts_origin.sec, smp.ts_origin.nsec);
            } else {
                line.push_str("nan.nan");
            }
        }

        if self.mask & flags::HAS_OFFSET != 0 && smp.flags & flags::HAS_TS_RECEIVED != 0 {
            let _ = write!(line, "{:+e}", smp.ts_origin.delta(&smp.ts_received));
        }

        if self.mask & flags::HAS_SEQUENCE != 0 && smp.flags & flags::HAS_SEQUENCE != 0 {
            let _ = write!(line, "({})", smp.sequence);
        }

        if self.mask & flags::HAS_DATA != 0 {
            for i in 0..smp.len().min(self.signals.len()) {
                line.push(self.separator);
                line.push_str(&smp.data()[i].print_str(self.signals[i].ty));
            }
        }

        line.push(self.delimiter);
        line
    }

    fn scan_single(&self, line: &str, smp: &mut SampleRef) -> std::result::Result<(), WireError> {
        let s = smp.as_mut();
        s.flags = 0;
        s.signals = Some(self.signals.clone());

        let mut fields = line.split(self.separator);
        let head = fields.next().unwrap_or("");

        let header = parse_header(head)?;
        if let Some(ts) = header.origin {
            s.ts_origin = ts;
            s.flags |= flags::HAS_TS_ORIGIN;
        }
        if let Some(seq) = header.sequence {
            s.sequence = seq;
            s.flags |= flags::HAS_SEQUENCE;
        }
        if let Some(offset) = header.offset {
            s.ts_received = s.ts_origin.add_secs(offset);
            s.flags |= flags::HAS_OFFSET | flags::HAS_TS_RECEIVED;
        }

        let mut n = 0;
        for (i, token) in fields.enumerate() {
            if token.is_empty() || i >= s.capacity() || i >= self.signals.len() {
                break;
            }
            let v = SignalData::parse_str(self.signals[i].ty, token).map_err(|e| match e {
                WireError::InvalidValueType { expected, token, .. } => {
                    WireError::InvalidValueType {
                        signal: self.signals[i].name.clone(),
                        expected,
                        token,
                    }
                }
                other => other,
            })?;
            s.data_mut()[i] = v;
            n = i + 1;
        }

        s.set_len(n);
        if n > 0 {
            s.flags |= flags::HAS_DATA;
        }

        Ok(())
    }
}

struct ScannedHeader {
    origin: Option<Timestamp>,
    offset: Option<f64>,
    sequence: Option<u64>,
}

/// Parse `SECONDS[.NANOSECONDS][+OFFSET][(SEQUENCE)]`. `nan.nan` stands for
/// an absent origin timestamp.
fn parse_header(head: &str) -> std::result::Result<ScannedHeader, WireError> {
    let mut out = ScannedHeader {
        origin: None,
        offset: None,
        sequence: None,
    };

    let malformed = |msg: &str| WireError::Malformed(format!("'{}': {}", head, msg));

    let mut rest = head;

    if let Some(r) = rest.strip_prefix("nan.nan") {
        rest = r;
    } else {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Err(malformed("missing seconds"));
        }
        let sec: i64 = rest[..digits].parse().map_err(|_| malformed("bad seconds"))?;
        rest = &rest[digits..];

        let mut nsec = 0u32;
        if let Some(r) = rest.strip_prefix('.') {
            let digits = r.len() - r.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            if digits == 0 {
                return Err(malformed("bad nanoseconds"));
            }
            nsec = r[..digits].parse().map_err(|_| malformed("bad nanoseconds"))?;
            rest = &r[digits..];
        }

        out.origin = Some(Timestamp::new(sec, nsec));
    }

    if rest.starts_with('+') || rest.starts_with('-') {
        let end = rest.find('(').unwrap_or(rest.len());
        let offset: f64 = rest[..end].parse().map_err(|_| malformed("bad offset"))?;
        out.offset = Some(offset);
        rest = &rest[end..];
    }

    if let Some(r) = rest.strip_prefix('(') {
        let close = r.find(')').ok_or_else(|| malformed("unterminated sequence"))?;
        let seq: u64 = r[..close].parse().map_err(|_| malformed("bad sequence"))?;
        out.sequence = Some(seq);
        rest = &r[close + 1..];
    }

    if !rest.is_empty() {
        return Err(malformed("trailing characters"));
    }

    Ok(out)
}

impl Format for HumanFormat {
    fn print(&mut self, buf: &mut [u8], smps: &[SampleRef]) -> Result<(usize, usize)> {
        let mut pos = 0;
        let mut count = 0;
        for smp in smps {
            let line = self.print_single(smp);
            if pos + line.len() > buf.len() {
                break;
            }
            buf[pos..pos + line.len()].copy_from_slice(line.as_bytes());
            pos += line.len();
            count += 1;
        }
        Ok((pos, count))
    }

    fn scan(&mut self, buf: &[u8], smps: &mut [SampleRef]) -> Result<(usize, usize)> {
        let text = std::str::from_utf8(buf)
            .map_err(|_| WireError::Malformed("invalid utf-8".to_string()))?;

        let mut pos = 0;
        let mut count = 0;

        while count < smps.len() {
            let nl = match text[pos..].find(self.delimiter) {
                Some(n) => n,
                None => break, // incomplete trailing line stays in the buffer
            };
            let line = &text[pos..pos + nl];
            pos += nl + 1;

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            self.scan_single(line, &mut smps[count])?;
            count += 1;
        }

        Ok((pos, count))
    }

    fn header(&self) -> Option<String> {
        let mut h = String::from("# ");
        if self.mask & flags::HAS_TS_ORIGIN != 0 {
            h.push_str("seconds.nanoseconds");
        }
        if self.mask & flags::HAS_OFFSET != 0 {
            h.push_str("+offset");
        }
        if self.mask & flags::HAS_SEQUENCE != 0 {
            h.push_str("(sequence)");
        }
        if self.mask & flags::HAS_DATA != 0 {
            for sig in self.signals.iter() {
                h.push(self.separator);
                h.push_str(&sig.name);
                if let Some(unit) = &sig.unit {
                    let _ = write!(h, "[{}]", unit);
                }
            }
        }
        h.push(self.delimiter);
        Some(h)
    }
}
