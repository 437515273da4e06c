//! Raw payload format: values only, fixed width, no framing.
//!
//! Variants select 8/16/32/64-bit width and byte order. The fake-header
//! variant reinterprets the first three scalar slots as sequence, seconds and
//! nanoseconds; those are always encoded as integers.
//!
//! Without framing a buffer holds exactly one sample, so `scan` decodes one
//! record spanning the whole input. Float and complex values have no 8/16-bit
//! encoding; requesting one is an error, not a truncation.

use crate::error::{Error, Result, WireError};
use crate::format::{ByteReader, ByteWriter, Format};
use crate::sample::{flags, SampleRef};
use crate::signal::{SignalData, SignalList, SignalType};

pub struct RawFormat {
    signals: SignalList,
    bits: u32,
    big_endian: bool,
    fake_header: bool,
}

/// Resolve a `raw.` registry suffix: `{8,16,32,64}[.{be,le}][.fake]`.
pub fn from_name(rest: &str, signals: SignalList) -> Result<Box<dyn Format>> {
    let mut parts = rest.split('.');

    let bits: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::config(format!("bad raw format 'raw.{}'", rest)))?;
    if !matches!(bits, 8 | 16 | 32 | 64) {
        return Err(Error::config(format!("unsupported raw width {}", bits)));
    }

    let mut big_endian = false;
    let mut fake_header = false;
    for part in parts {
        match part {
            "be" => big_endian = true,
            "le" => big_endian = false,
            "fake" => fake_header = true,
            _ => {
                return Err(Error::config(format!(
                    "bad raw format modifier '{}' in 'raw.{}'",
                    part, rest
                )))
            }
        }
    }

    Ok(Box::new(RawFormat {
        signals,
        bits,
        big_endian,
        fake_header,
    }))
}

impl RawFormat {
    pub fn new(signals: SignalList, bits: u32, big_endian: bool, fake_header: bool) -> Self {
        RawFormat {
            signals,
            bits,
            big_endian,
            fake_header,
        }
    }

    fn word_bytes(&self) -> usize {
        (self.bits / 8) as usize
    }

    fn put_word(&self, w: &mut ByteWriter<'_>, value: u64) {
        let be = self.big_endian;
        match self.bits {
            8 => w.put_bytes(&[value as u8]),
            16 => {
                let b = if be {
                    (value as u16).to_be_bytes()
                } else {
                    (value as u16).to_le_bytes()
                };
                w.put_bytes(&b);
            }
            32 => w.put_u32(value as u32, be),
            64 => w.put_u64(value, be),
            _ => unreachable!(),
        }
    }

    fn get_word(&self, r: &mut ByteReader<'_>) -> u64 {
        let be = self.big_endian;
        match self.bits {
            8 => r.take(1)[0] as u64,
            16 => {
                let mut b = [0u8; 2];
                b.copy_from_slice(r.take(2));
                if be {
                    u16::from_be_bytes(b) as u64
                } else {
                    u16::from_le_bytes(b) as u64
                }
            }
            32 => r.get_u32(be) as u64,
            64 => r.get_u64(be),
            _ => unreachable!(),
        }
    }

    /// Sign-extend an integer word of the configured width.
    fn extend_int(&self, word: u64) -> i64 {
        match self.bits {
            8 => word as u8 as i8 as i64,
            16 => word as u16 as i16 as i64,
            32 => word as u32 as i32 as i64,
            64 => word as i64,
            _ => unreachable!(),
        }
    }

    fn encode_value(
        &self,
        w: &mut ByteWriter<'_>,
        v: SignalData,
        ty: SignalType,
    ) -> Result<usize> {
        match ty {
            SignalType::Float => match self.bits {
                32 => {
                    self.put_word(w, (v.f() as f32).to_bits() as u64);
                    Ok(1)
                }
                64 => {
                    self.put_word(w, v.f().to_bits());
                    Ok(1)
                }
                _ => Err(WireError::Unsupported(format!(
                    "float values cannot be encoded at {} bit",
                    self.bits
                ))
                .into()),
            },
            SignalType::Integer => {
                self.put_word(w, v.i() as u64);
                Ok(1)
            }
            SignalType::Boolean => {
                self.put_word(w, v.b() as u64);
                Ok(1)
            }
            SignalType::Complex => match self.bits {
                32 => {
                    let z = v.z();
                    self.put_word(w, z.real.to_bits() as u64);
                    self.put_word(w, z.imag.to_bits() as u64);
                    Ok(2)
                }
                64 => {
                    let z = v.z();
                    self.put_word(w, (z.real as f64).to_bits());
                    self.put_word(w, (z.imag as f64).to_bits());
                    Ok(2)
                }
                _ => Err(WireError::Unsupported(format!(
                    "complex values cannot be encoded at {} bit",
                    self.bits
                ))
                .into()),
            },
        }
    }

    /// Words one value of this type occupies, or an error for unsupported
    /// width/type combinations.
    fn value_words(&self, ty: SignalType) -> Result<usize> {
        match ty {
            SignalType::Integer | SignalType::Boolean => Ok(1),
            SignalType::Float => {
                if self.bits >= 32 {
                    Ok(1)
                } else {
                    Err(WireError::Unsupported(format!(
                        "float values cannot be decoded at {} bit",
                        self.bits
                    ))
                    .into())
                }
            }
            SignalType::Complex => {
                if self.bits >= 32 {
                    Ok(2)
                } else {
                    Err(WireError::Unsupported(format!(
                        "complex values cannot be decoded at {} bit",
                        self.bits
                    ))
                    .into())
                }
            }
        }
    }
}

impl Format for RawFormat {
    fn print(&mut self, buf: &mut [u8], smps: &[SampleRef]) -> Result<(usize, usize)> {
        let mut w = ByteWriter::new(buf);
        let mut count = 0;

        for smp in smps {
            // Size check first so a sample is never cut in half.
            let mut words = if self.fake_header { 3 } else { 0 };
            let len = smp.len().min(self.signals.len());
            for i in 0..len {
                words += self.value_words(self.signals[i].ty)?;
            }
            if w.remaining() < words * self.word_bytes() {
                break;
            }

            if self.fake_header {
                self.put_word(&mut w, smp.sequence);
                self.put_word(&mut w, smp.ts_origin.sec as u64);
                self.put_word(&mut w, smp.ts_origin.nsec as u64);
            }

            for i in 0..len {
                self.encode_value(&mut w, smp.data()[i], self.signals[i].ty)?;
            }

            count += 1;
        }

        Ok((w.pos(), count))
    }

    fn scan(&mut self, buf: &[u8], smps: &mut [SampleRef]) -> Result<(usize, usize)> {
        let word = self.word_bytes();
        if buf.len() % word != 0 {
            return Err(WireError::Malformed(format!(
                "raw payload length {} is not a multiple of {} bytes",
                buf.len(),
                word
            ))
            .into());
        }

        let smp = match smps.first_mut() {
            Some(s) => s,
            None => return Ok((0, 0)),
        };

        let mut r = ByteReader::new(buf);
        let s = smp.as_mut();
        s.signals = Some(self.signals.clone());

        if self.fake_header {
            if r.remaining() < 3 * word {
                return Err(WireError::Malformed(
                    "raw payload too short for fake header".to_string(),
                )
                .into());
            }
            s.sequence = self.extend_int(self.get_word(&mut r)) as u64;
            s.ts_origin.sec = self.extend_int(self.get_word(&mut r));
            s.ts_origin.nsec = self.extend_int(self.get_word(&mut r)) as u32;
            s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN;
        } else {
            s.sequence = 0;
            s.ts_origin = Default::default();
            s.flags = 0;
        }

        let mut n = 0;
        for i in 0..s.capacity().min(self.signals.len()) {
            let ty = self.signals[i].ty;
            let words = self.value_words(ty)?;
            if r.remaining() < words * word {
                break;
            }

            let v = match ty {
                SignalType::Float => match self.bits {
                    32 => SignalData::float(f32::from_bits(self.get_word(&mut r) as u32) as f64),
                    64 => SignalData::float(f64::from_bits(self.get_word(&mut r))),
                    _ => unreachable!("checked by value_words"),
                },
                SignalType::Integer => SignalData::integer(self.extend_int(self.get_word(&mut r))),
                SignalType::Boolean => SignalData::boolean(self.get_word(&mut r) != 0),
                SignalType::Complex => {
                    let (re, im) = match self.bits {
                        32 => (
                            f32::from_bits(self.get_word(&mut r) as u32),
                            f32::from_bits(self.get_word(&mut r) as u32),
                        ),
                        64 => (
                            f64::from_bits(self.get_word(&mut r)) as f32,
                            f64::from_bits(self.get_word(&mut r)) as f32,
                        ),
                        _ => unreachable!("checked by value_words"),
                    };
                    SignalData::complex(re, im)
                }
            };

            s.data_mut()[i] = v;
            n = i + 1;
        }

        s.set_len(n);
        if n > 0 {
            s.flags |= flags::HAS_DATA;
        }

        Ok((r.pos(), 1))
    }

    fn has_binary_payload(&self) -> bool {
        true
    }
}
