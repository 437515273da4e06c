//! JSON line format: one object per sample.
//!
//! ```text
//! {"ts":{"origin":[100,500000000],"received":[100,500100000]},"sequence":42,"data":[1.0,2.0]}
//! ```
//!
//! Complex values serialize as `{"real":..,"imag":..}`. Decoding a value
//! against a mismatched signal type fails, it never coerces.

use serde_json::{json, Map, Value};

use crate::error::{Result, WireError};
use crate::format::Format;
use crate::sample::{flags, Sample, SampleRef};
use crate::signal::{SignalData, SignalList};
use crate::timing::Timestamp;

pub struct JsonFormat {
    signals: SignalList,
    mask: u32,
}

impl JsonFormat {
    pub fn new(signals: SignalList) -> Self {
        JsonFormat {
            signals,
            mask: flags::HAS_TS_ORIGIN
                | flags::HAS_TS_RECEIVED
                | flags::HAS_SEQUENCE
                | flags::HAS_DATA,
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    fn pack_single(&self, smp: &Sample) -> Value {
        let mut obj = Map::new();

        let mut ts = Map::new();
        if self.mask & smp.flags & flags::HAS_TS_ORIGIN != 0 {
            ts.insert(
                "origin".to_string(),
                json!([smp.ts_origin.sec, smp.ts_origin.nsec]),
            );
        }
        if self.mask & smp.flags & flags::HAS_TS_RECEIVED != 0 {
            ts.insert(
                "received".to_string(),
                json!([smp.ts_received.sec, smp.ts_received.nsec]),
            );
        }
        if !ts.is_empty() {
            obj.insert("ts".to_string(), Value::Object(ts));
        }

        if self.mask & smp.flags & flags::HAS_SEQUENCE != 0 {
            obj.insert("sequence".to_string(), json!(smp.sequence));
        }

        if self.mask & smp.flags & flags::HAS_DATA != 0 {
            let data: Vec<Value> = (0..smp.len().min(self.signals.len()))
                .map(|i| smp.data()[i].pack_json(self.signals[i].ty))
                .collect();
            obj.insert("data".to_string(), Value::Array(data));
        }

        Value::Object(obj)
    }

    fn unpack_single(
        &self,
        value: &Value,
        smp: &mut SampleRef,
    ) -> std::result::Result<(), WireError> {
        let s = smp.as_mut();
        s.flags = 0;
        s.signals = Some(self.signals.clone());

        let obj = value
            .as_object()
            .ok_or_else(|| WireError::Malformed("sample is not an object".to_string()))?;

        let parse_ts = |v: &Value| -> std::result::Result<Timestamp, WireError> {
            let arr = v
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| WireError::Malformed("timestamp is not [sec, nsec]".to_string()))?;
            let sec = arr[0]
                .as_i64()
                .ok_or_else(|| WireError::Malformed("bad timestamp seconds".to_string()))?;
            let nsec = arr[1]
                .as_u64()
                .ok_or_else(|| WireError::Malformed("bad timestamp nanoseconds".to_string()))?;
            Ok(Timestamp::new(sec, nsec as u32))
        };

        if let Some(ts) = obj.get("ts").and_then(|v| v.as_object()) {
            if let Some(origin) = ts.get("origin") {
                s.ts_origin = parse_ts(origin)?;
                s.flags |= flags::HAS_TS_ORIGIN;
            }
            if let Some(received) = ts.get("received") {
                s.ts_received = parse_ts(received)?;
                s.flags |= flags::HAS_TS_RECEIVED;
            }
        }

        if let Some(seq) = obj.get("sequence") {
            s.sequence = seq
                .as_u64()
                .ok_or_else(|| WireError::Malformed("bad sequence".to_string()))?;
            s.flags |= flags::HAS_SEQUENCE;
        }

        let mut n = 0;
        if let Some(data) = obj.get("data") {
            let arr = data
                .as_array()
                .ok_or_else(|| WireError::Malformed("data is not an array".to_string()))?;
            for (i, v) in arr.iter().enumerate() {
                if i >= s.capacity() || i >= self.signals.len() {
                    break;
                }
                let parsed =
                    SignalData::parse_json(self.signals[i].ty, v).map_err(|e| match e {
                        WireError::InvalidValueType { expected, token, .. } => {
                            WireError::InvalidValueType {
                                signal: self.signals[i].name.clone(),
                                expected,
                                token,
                            }
                        }
                        other => other,
                    })?;
                s.data_mut()[i] = parsed;
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

impl Format for JsonFormat {
    fn print(&mut self, buf: &mut [u8], smps: &[SampleRef]) -> Result<(usize, usize)> {
        let mut pos = 0;
        let mut count = 0;
        for smp in smps {
            let mut line = self.pack_single(smp).to_string();
            line.push('\n');
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
            let nl = match text[pos..].find('\n') {
                Some(n) => n,
                None => break,
            };
            let line = &text[pos..pos + nl];
            pos += nl + 1;

            if line.trim().is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(line)
                .map_err(|e| WireError::Malformed(format!("invalid json: {}", e)))?;
            self.unpack_single(&value, &mut smps[count])?;
            count += 1;
        }

        Ok((pos, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryType, Pool};
    use crate::signal::{signal_list_generate, Signal, SignalType};
    use std::sync::Arc;

    #[test]
    fn test_roundtrip() {
        let signals = signal_list_generate(2, SignalType::Float);
        let pool = Pool::new(8, 4, MemoryType::Heap).unwrap();

        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.sequence = 11;
            s.ts_origin = Timestamp::new(5, 100);
            s.ts_received = Timestamp::new(5, 300);
            s.flags = flags::HAS_SEQUENCE
                | flags::HAS_TS_ORIGIN
                | flags::HAS_TS_RECEIVED
                | flags::HAS_DATA;
            s.signals = Some(signals.clone());
            s.set_len(2);
            s.data_mut()[0] = SignalData::float(0.25);
            s.data_mut()[1] = SignalData::float(-8.0);
        }

        let mut fmt = JsonFormat::new(signals);
        let mut buf = [0u8; 512];
        let (bytes, cnt) = fmt.print(&mut buf, &[smp]).unwrap();
        assert_eq!(cnt, 1);

        let mut out = Vec::new();
        pool.alloc_many(&mut out, 1);
        let (consumed, cnt) = fmt.scan(&buf[..bytes], &mut out).unwrap();
        assert_eq!((consumed, cnt), (bytes, 1));

        let s = &out[0];
        assert_eq!(s.sequence, 11);
        assert_eq!(s.ts_origin, Timestamp::new(5, 100));
        assert_eq!(s.ts_received, Timestamp::new(5, 300));
        assert_eq!(s.data()[0].f(), 0.25);
        assert_eq!(s.data()[1].f(), -8.0);
    }

    #[test]
    fn test_complex_object_form() {
        let signals: SignalList = Arc::new(vec![Arc::new(Signal::new("z", SignalType::Complex))]);
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();

        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.flags = flags::HAS_DATA;
            s.signals = Some(signals.clone());
            s.set_len(1);
            s.data_mut()[0] = SignalData::complex(1.5, -0.5);
        }

        let fmt = JsonFormat::new(signals.clone());
        let line = fmt.pack_single(&smp).to_string();
        assert!(line.contains("\"real\":1.5"));
        assert!(line.contains("\"imag\":-0.5"));

        let mut out = Vec::new();
        pool.alloc_many(&mut out, 1);
        let mut fmt = JsonFormat::new(signals);
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        let (_, cnt) = fmt.scan(&bytes, &mut out).unwrap();
        assert_eq!(cnt, 1);
        assert_eq!(out[0].data()[0].z(), crate::signal::Complex::new(1.5, -0.5));
    }

    #[test]
    fn test_mismatch_fails() {
        let signals = signal_list_generate(1, SignalType::Boolean);
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();
        let mut out = Vec::new();
        pool.alloc_many(&mut out, 1);

        let mut fmt = JsonFormat::new(signals);
        assert!(fmt.scan(b"{\"data\":[1]}\n", &mut out).is_err());
    }

    #[test]
    fn test_missing_fields_clear_flags() {
        let signals = signal_list_generate(1, SignalType::Float);
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();
        let mut out = Vec::new();
        pool.alloc_many(&mut out, 1);

        let mut fmt = JsonFormat::new(signals);
        let (_, cnt) = fmt.scan(b"{\"data\":[4.0]}\n", &mut out).unwrap();
        assert_eq!(cnt, 1);
        let s = &out[0];
        assert_eq!(s.flags & flags::HAS_SEQUENCE, 0);
        assert_eq!(s.flags & flags::HAS_TS_ORIGIN, 0);
        assert!(s.flags & flags::HAS_DATA != 0);
    }
}
