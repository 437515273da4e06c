//! Separated-values line format (csv and tsv).
//!
//! Columns follow the flags mask in a fixed order: seconds, nanoseconds,
//! offset, sequence, then the data values. Absent optional fields print as
//! `nan` so the column layout stays stable.

use std::fmt::Write as _;

use crate::error::{Result, WireError};
use crate::format::Format;
use crate::sample::{flags, Sample, SampleRef};
use crate::signal::{SignalData, SignalList};

pub struct CsvFormat {
    signals: SignalList,
    mask: u32,
    separator: char,
    delimiter: char,
}

impl CsvFormat {
    pub fn new(signals: SignalList, separator: char) -> Self {
        CsvFormat {
            signals,
            mask: flags::HAS_TS_ORIGIN | flags::HAS_SEQUENCE | flags::HAS_DATA,
            separator,
            delimiter: '\n',
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    fn print_single(&self, smp: &Sample) -> String {
        let mut line = String::new();
        let sep = self.separator;

        if self.mask & flags::HAS_TS_ORIGIN != 0 {
            if smp.flags & flags::HAS_TS_ORIGIN != 0 {
                let _ = write!(line, "{}{}{:09}", smp.ts_origin.sec, sep, smp.ts_origin.nsec);
            } else {
                let _ = write!(line, "nan{}nan", sep);
            }
        }

        if self.mask & flags::HAS_OFFSET != 0 {
            if smp.flags & flags::HAS_TS_RECEIVED != 0 {
                let _ = write!(line, "{}{:.9}", sep, smp.ts_origin.delta(&smp.ts_received));
            } else {
                let _ = write!(line, "{}nan", sep);
            }
        }

        if self.mask & flags::HAS_SEQUENCE != 0 {
            if smp.flags & flags::HAS_SEQUENCE != 0 {
                let _ = write!(line, "{}{}", sep, smp.sequence);
            } else {
                let _ = write!(line, "{}nan", sep);
            }
        }

        if self.mask & flags::HAS_DATA != 0 {
            for i in 0..smp.len().min(self.signals.len()) {
                line.push(sep);
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

        let malformed = |msg: &str| WireError::Malformed(format!("'{}': {}", line, msg));

        let mut fields = line.split(self.separator);
        let mut next = |what: &'static str| {
            fields
                .next()
                .ok_or_else(|| WireError::Malformed(format!("missing {} column", what)))
        };

        if self.mask & flags::HAS_TS_ORIGIN != 0 {
            let sec = next("seconds")?;
            let nsec = next("nanoseconds")?;
            if sec != "nan" {
                s.ts_origin.sec = sec.parse().map_err(|_| malformed("bad seconds"))?;
                s.ts_origin.nsec = nsec.parse().map_err(|_| malformed("bad nanoseconds"))?;
                s.flags |= flags::HAS_TS_ORIGIN;
            }
        }

        if self.mask & flags::HAS_OFFSET != 0 {
            let off = next("offset")?;
            if off != "nan" {
                let offset: f64 = off.parse().map_err(|_| malformed("bad offset"))?;
                s.ts_received = s.ts_origin.add_secs(offset);
                s.flags |= flags::HAS_OFFSET | flags::HAS_TS_RECEIVED;
            }
        }

        if self.mask & flags::HAS_SEQUENCE != 0 {
            let seq = next("sequence")?;
            if seq != "nan" {
                s.sequence = seq.parse().map_err(|_| malformed("bad sequence"))?;
                s.flags |= flags::HAS_SEQUENCE;
            }
        }

        let mut n = 0;
        if self.mask & flags::HAS_DATA != 0 {
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
        }

        s.set_len(n);
        if n > 0 {
            s.flags |= flags::HAS_DATA;
        }

        Ok(())
    }
}

impl Format for CsvFormat {
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
                None => break,
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
        let sep = self.separator;
        let mut first = true;
        let mut put = |h: &mut String, name: &str| {
            if !first {
                h.push(sep);
            }
            h.push_str(name);
            first = false;
        };

        if self.mask & flags::HAS_TS_ORIGIN != 0 {
            put(&mut h, "secs");
            put(&mut h, "nsecs");
        }
        if self.mask & flags::HAS_OFFSET != 0 {
            put(&mut h, "offset");
        }
        if self.mask & flags::HAS_SEQUENCE != 0 {
            put(&mut h, "sequence");
        }
        if self.mask & flags::HAS_DATA != 0 {
            for sig in self.signals.iter() {
                let col = match &sig.unit {
                    Some(unit) => format!("{}[{}]", sig.name, unit),
                    None => sig.name.clone(),
                };
                put(&mut h, &col);
            }
        }

        h.push(self.delimiter);
        Some(h)
    }
}
