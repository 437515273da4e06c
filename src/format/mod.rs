//! Format codecs.
//!
//! A codec encodes and decodes arrays of samples against a fixed configured
//! signal list and a flags mask naming the optional sample fields it carries.
//! The byte-oriented `print`/`scan` pair is the canonical interface; line
//! formats additionally expose a header line.

pub mod binary;
pub mod csv;
pub mod human;
pub mod json;
pub mod raw;

use crate::error::{Error, Result};
use crate::sample::SampleRef;
use crate::signal::SignalList;

pub use binary::BinaryFormat;
pub use csv::CsvFormat;
pub use human::HumanFormat;
pub use json::JsonFormat;
pub use raw::RawFormat;

/// Encode/decode surface invoked by nodes and hooks.
pub trait Format: Send {
    /// Encode as many samples as fit into `buf`; never truncates a single
    /// sample mid-record. Returns `(bytes_written, samples_encoded)`.
    fn print(&mut self, buf: &mut [u8], smps: &[SampleRef]) -> Result<(usize, usize)>;

    /// Decode samples into the pre-allocated slots until buffer underflow or
    /// parse error. Returns `(bytes_consumed, samples_decoded)`; consumed
    /// bytes always cover complete records only.
    fn scan(&mut self, buf: &[u8], smps: &mut [SampleRef]) -> Result<(usize, usize)>;

    /// Header line for line-oriented formats.
    fn header(&self) -> Option<String> {
        None
    }

    /// Footer line for line-oriented formats.
    fn footer(&self) -> Option<String> {
        None
    }

    /// Binary-payload formats must not be read line-delimited.
    fn has_binary_payload(&self) -> bool {
        false
    }
}

/// Instantiate a codec by registry name.
///
/// Known names: `human`, `csv`, `tsv`, `json`, `binary`, `binary.web` and the
/// raw family `raw.{8,16,32,64}[.{be,le}][.fake]`.
pub fn new_format(name: &str, signals: SignalList) -> Result<Box<dyn Format>> {
    if let Some(rest) = name.strip_prefix("raw.") {
        return raw::from_name(rest, signals);
    }

    match name {
        "human" => Ok(Box::new(HumanFormat::new(signals))),
        "csv" => Ok(Box::new(CsvFormat::new(signals, ','))),
        "tsv" => Ok(Box::new(CsvFormat::new(signals, '\t'))),
        "json" => Ok(Box::new(JsonFormat::new(signals))),
        "binary" => Ok(Box::new(BinaryFormat::new(signals, false))),
        "binary.web" => Ok(Box::new(BinaryFormat::new(signals, true))),
        _ => Err(Error::config(format!("unknown format '{}'", name))),
    }
}

/// Cursor for writing records into a caller-supplied byte buffer.
pub(crate) struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn put_u32(&mut self, v: u32, big_endian: bool) {
        let b = if big_endian {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        };
        self.put_bytes(&b);
    }

    pub fn put_u64(&mut self, v: u64, big_endian: bool) {
        let b = if big_endian {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        };
        self.put_bytes(&b);
    }
}

/// Cursor for reading records from a byte buffer.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> &'a [u8] {
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    pub fn get_u32(&mut self, big_endian: bool) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        if big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        }
    }

    pub fn get_u64(&mut self, big_endian: bool) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        if big_endian {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        }
    }
}
