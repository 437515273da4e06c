//! Canonical binary wire format.
//!
//! # Record layout
//!
//! ```text
//! ┌──────────────────────────────┬───────────┬─────────┬─────────┬──────────┐
//! │ version(4) type(2) rsvd(10)  │ sequence  │ ts.sec  │ ts.nsec │ values   │
//! │          length(16)          │  32 bit   │ 32 bit  │ 32 bit  │ variable │
//! └──────────────────────────────┴───────────┴─────────┴─────────┴──────────┘
//! ```
//!
//! `length` counts value slots. Float slots encode as 64-bit IEEE754,
//! integer and boolean slots as 32-bit words, all big-endian on the wire.
//! The `web` variant flips everything to little-endian to match browser-side
//! typed arrays.

use log::warn;

use crate::error::{Result, WireError};
use crate::format::{ByteReader, ByteWriter, Format};
use crate::sample::{flags, SampleRef};
use crate::signal::{SignalData, SignalList, SignalType};

pub const VERSION: u8 = 2;
const TYPE_DATA: u8 = 0;
const HEADER_LEN: usize = 16;

pub struct BinaryFormat {
    signals: SignalList,
    /// Little-endian `web` variant.
    web: bool,
}

impl BinaryFormat {
    pub fn new(signals: SignalList, web: bool) -> Self {
        BinaryFormat { signals, web }
    }

    fn value_width(ty: SignalType) -> Result<usize> {
        match ty {
            SignalType::Float => Ok(8),
            SignalType::Integer | SignalType::Boolean => Ok(4),
            SignalType::Complex => Err(WireError::Unsupported(
                "complex values have no binary wire encoding".into(),
            )
            .into()),
        }
    }

    /// Byte size of one record with `len` value slots typed by the
    /// configured signal list.
    fn record_len(&self, len: usize) -> Result<usize> {
        let mut total = HEADER_LEN;
        for i in 0..len {
            let ty = self
                .signals
                .get(i)
                .map(|s| s.ty)
                .unwrap_or(SignalType::Float);
            total += Self::value_width(ty)?;
        }
        Ok(total)
    }
}

impl Format for BinaryFormat {
    fn print(&mut self, buf: &mut [u8], smps: &[SampleRef]) -> Result<(usize, usize)> {
        let be = !self.web;
        let mut w = ByteWriter::new(buf);
        let mut count = 0;

        for smp in smps {
            let len = smp.len().min(self.signals.len()).min(0xffff);
            let need = self.record_len(len)?;
            if w.remaining() < need {
                break;
            }

            let word = (VERSION as u32) << 28 | (TYPE_DATA as u32) << 26 | len as u32;
            w.put_u32(word, be);
            w.put_u32(smp.sequence as u32, be);
            w.put_u32(smp.ts_origin.sec as u32, be);
            w.put_u32(smp.ts_origin.nsec, be);

            for i in 0..len {
                let v = smp.data()[i];
                match self.signals[i].ty {
                    SignalType::Float => w.put_u64(v.f().to_bits(), be),
                    SignalType::Integer => w.put_u32(v.i() as u32, be),
                    SignalType::Boolean => w.put_u32(v.b() as u32, be),
                    SignalType::Complex => unreachable!("rejected by record_len"),
                }
            }

            count += 1;
        }

        Ok((w.pos(), count))
    }

    fn scan(&mut self, buf: &[u8], smps: &mut [SampleRef]) -> Result<(usize, usize)> {
        if buf.len() % 4 != 0 {
            return Err(WireError::Malformed(format!(
                "packet size {} is not a multiple of 4 bytes",
                buf.len()
            ))
            .into());
        }

        let be = !self.web;
        let mut r = ByteReader::new(buf);
        let mut count = 0;

        for smp in smps.iter_mut() {
            if r.remaining() == 0 {
                break;
            }
            if r.remaining() < HEADER_LEN {
                warn!("truncated message header, {} bytes left", r.remaining());
                break;
            }

            let mark = r.pos();
            let word = r.get_u32(be);
            let version = (word >> 28) as u8;
            let len = (word & 0xffff) as usize;

            if version != VERSION {
                return Err(WireError::BadVersion(version).into());
            }

            let need = self.record_len(len)?;
            if buf.len() - mark < need {
                // Remainder of the record is outside the buffer; consume up
                // to the previous complete record.
                warn!("truncated message body, {} bytes left", buf.len() - mark);
                return Ok((mark, count));
            }

            let sequence = r.get_u32(be) as u64;
            let sec = r.get_u32(be) as i64;
            let nsec = r.get_u32(be);

            let s = smp.as_mut();
            let take = len.min(s.capacity()).min(self.signals.len());
            s.sequence = sequence;
            s.ts_origin.sec = sec;
            s.ts_origin.nsec = nsec;
            s.signals = Some(self.signals.clone());
            s.set_len(take);
            s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN;
            if take > 0 {
                s.flags |= flags::HAS_DATA;
            }

            for i in 0..len {
                let ty = self
                    .signals
                    .get(i)
                    .map(|sig| sig.ty)
                    .unwrap_or(SignalType::Float);
                let v = match ty {
                    SignalType::Float => SignalData::float(f64::from_bits(r.get_u64(be))),
                    SignalType::Integer => SignalData::integer(r.get_u32(be) as i32 as i64),
                    SignalType::Boolean => SignalData::boolean(r.get_u32(be) != 0),
                    SignalType::Complex => unreachable!("rejected by record_len"),
                };
                if i < take {
                    s.data_mut()[i] = v;
                }
            }

            count += 1;
        }

        Ok((r.pos(), count))
    }

    fn has_binary_payload(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryType, Pool};
    use crate::signal::signal_list_generate;
    use crate::timing::Timestamp;

    fn make_sample(pool: &Pool, signals: &SignalList, seq: u64, vals: &[f64]) -> SampleRef {
        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.sequence = seq;
            s.ts_origin = Timestamp::new(100, 500_000_000);
            s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN | flags::HAS_DATA;
            s.signals = Some(signals.clone());
            s.set_len(vals.len());
            for (i, v) in vals.iter().enumerate() {
                s.data_mut()[i] = SignalData::float(*v);
            }
        }
        smp
    }

    #[test]
    fn test_wire_layout_big_endian() {
        let signals = signal_list_generate(1, SignalType::Float);
        let pool = Pool::new(4, 4, MemoryType::Heap).unwrap();
        let smp = make_sample(&pool, &signals, 42, &[1.0]);

        let mut fmt = BinaryFormat::new(signals, false);
        let mut buf = [0u8; 64];
        let (bytes, cnt) = fmt.print(&mut buf, &[smp]).unwrap();
        assert_eq!(cnt, 1);
        assert_eq!(bytes, 16 + 8);

        // version 2, type 0, length 1
        assert_eq!(&buf[0..4], &[0x20, 0x00, 0x00, 0x01]);
        // sequence 42
        assert_eq!(&buf[4..8], &[0x00, 0x00, 0x00, 0x2a]);
        // ts: 100 s, 500_000_000 ns
        assert_eq!(&buf[8..12], &[0x00, 0x00, 0x00, 0x64]);
        assert_eq!(&buf[12..16], &[0x1d, 0xcd, 0x65, 0x00]);
        // 1.0 as big-endian f64
        assert_eq!(&buf[16..24], &1.0f64.to_be_bytes());
    }

    #[test]
    fn test_roundtrip_mixed_types() {
        let signals: SignalList = std::sync::Arc::new(vec![
            std::sync::Arc::new(crate::signal::Signal::new("f", SignalType::Float)),
            std::sync::Arc::new(crate::signal::Signal::new("i", SignalType::Integer)),
            std::sync::Arc::new(crate::signal::Signal::new("b", SignalType::Boolean)),
        ]);
        let pool = Pool::new(8, 4, MemoryType::Heap).unwrap();

        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.sequence = 7;
            s.ts_origin = Timestamp::new(1, 2);
            s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN | flags::HAS_DATA;
            s.signals = Some(signals.clone());
            s.set_len(3);
            s.data_mut()[0] = SignalData::float(-2.5);
            s.data_mut()[1] = SignalData::integer(-7);
            s.data_mut()[2] = SignalData::boolean(true);
        }

        let mut fmt = BinaryFormat::new(signals.clone(), false);
        let mut buf = [0u8; 128];
        let (bytes, _) = fmt.print(&mut buf, &[smp]).unwrap();

        let mut out = Vec::new();
        pool.alloc_many(&mut out, 1);
        let (consumed, cnt) = fmt.scan(&buf[..bytes], &mut out).unwrap();
        assert_eq!(consumed, bytes);
        assert_eq!(cnt, 1);

        let s = &out[0];
        assert_eq!(s.sequence, 7);
        assert_eq!(s.ts_origin, Timestamp::new(1, 2));
        assert_eq!(s.len(), 3);
        assert_eq!(s.data()[0].f(), -2.5);
        assert_eq!(s.data()[1].i(), -7);
        assert!(s.data()[2].b());
    }

    #[test]
    fn test_web_variant_little_endian() {
        let signals = signal_list_generate(1, SignalType::Float);
        let pool = Pool::new(4, 4, MemoryType::Heap).unwrap();
        let smp = make_sample(&pool, &signals, 1, &[3.25]);

        let mut fmt = BinaryFormat::new(signals.clone(), true);
        let mut buf = [0u8; 64];
        let (bytes, _) = fmt.print(&mut buf, &[smp]).unwrap();

        // header word little-endian: length in the low 16 bits comes first
        assert_eq!(&buf[0..4], &[0x01, 0x00, 0x00, 0x20]);
        assert_eq!(&buf[16..24], &3.25f64.to_le_bytes());

        let mut out = Vec::new();
        pool.alloc_many(&mut out, 1);
        let (consumed, cnt) = fmt.scan(&buf[..bytes], &mut out).unwrap();
        assert_eq!((consumed, cnt), (bytes, 1));
        assert_eq!(out[0].data()[0].f(), 3.25);
    }

    #[test]
    fn test_scan_stops_at_partial_record() {
        let signals = signal_list_generate(2, SignalType::Float);
        let pool = Pool::new(8, 4, MemoryType::Heap).unwrap();
        let a = make_sample(&pool, &signals, 1, &[1.0, 2.0]);
        let b = make_sample(&pool, &signals, 2, &[3.0, 4.0]);

        let mut fmt = BinaryFormat::new(signals, false);
        let mut buf = [0u8; 128];
        let (bytes, cnt) = fmt.print(&mut buf, &[a, b]).unwrap();
        assert_eq!(cnt, 2);

        // Cut the second record short (keep 4-byte alignment).
        let cut = bytes - 8;
        let mut out = Vec::new();
        pool.alloc_many(&mut out, 2);
        let (consumed, cnt) = fmt.scan(&buf[..cut], &mut out).unwrap();
        assert_eq!(cnt, 1);
        assert_eq!(consumed, bytes / 2);
    }

    #[test]
    fn test_scan_rejects_bad_version() {
        let signals = signal_list_generate(1, SignalType::Float);
        let pool = Pool::new(4, 4, MemoryType::Heap).unwrap();

        let mut buf = [0u8; 24];
        buf[0] = 0x70; // version 7
        let mut out = Vec::new();
        pool.alloc_many(&mut out, 1);

        let mut fmt = BinaryFormat::new(signals, false);
        assert!(fmt.scan(&buf, &mut out).is_err());
    }

    #[test]
    fn test_scan_rejects_unaligned_length() {
        let signals = signal_list_generate(1, SignalType::Float);
        let pool = Pool::new(4, 4, MemoryType::Heap).unwrap();
        let mut out = Vec::new();
        pool.alloc_many(&mut out, 1);

        let mut fmt = BinaryFormat::new(signals, false);
        assert!(fmt.scan(&[0u8; 7], &mut out).is_err());
    }

    #[test]
    fn test_print_never_splits_a_record() {
        let signals = signal_list_generate(2, SignalType::Float);
        let pool = Pool::new(8, 4, MemoryType::Heap).unwrap();
        let a = make_sample(&pool, &signals, 1, &[1.0, 2.0]);
        let b = make_sample(&pool, &signals, 2, &[3.0, 4.0]);

        // Room for one and a half records.
        let mut buf = [0u8; 48];
        let mut fmt = BinaryFormat::new(signals, false);
        let (bytes, cnt) = fmt.print(&mut buf, &[a, b]).unwrap();
        assert_eq!(cnt, 1);
        assert_eq!(bytes, 32);
    }
}
