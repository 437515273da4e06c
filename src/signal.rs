//! Signal descriptors and signal values.
//!
//! A signal describes one scalar channel of a sample: name, optional unit and
//! value type. Values themselves are stored untyped in 64 bits and are
//! interpreted through the signal descriptor at the matching slot.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result, WireError};

/// Value type of one signal slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    Float,
    Integer,
    Boolean,
    Complex,
}

impl SignalType {
    pub fn from_str(s: &str) -> Result<SignalType> {
        match s {
            "float" => Ok(SignalType::Float),
            "integer" => Ok(SignalType::Integer),
            "boolean" => Ok(SignalType::Boolean),
            "complex" => Ok(SignalType::Complex),
            _ => Err(Error::config(format!("unknown signal type '{}'", s))),
        }
    }

    /// Single-character tag used by compact type-format strings like `"3f2i"`.
    pub fn from_fmt_char(c: char) -> Result<SignalType> {
        match c {
            'f' => Ok(SignalType::Float),
            'i' => Ok(SignalType::Integer),
            'b' => Ok(SignalType::Boolean),
            'c' => Ok(SignalType::Complex),
            _ => Err(Error::config(format!("unknown signal format char '{}'", c))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Float => "float",
            SignalType::Integer => "integer",
            SignalType::Boolean => "boolean",
            SignalType::Complex => "complex",
        }
    }
}

/// Complex value stored as two 32-bit floats.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub real: f32,
    pub imag: f32,
}

impl Complex {
    pub fn new(real: f32, imag: f32) -> Self {
        Complex { real, imag }
    }
}

/// One signal value. 64 bits of storage with exactly one live interpretation,
/// chosen by the signal descriptor of the slot it occupies.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignalData(u64);

impl SignalData {
    pub fn float(v: f64) -> Self {
        SignalData(v.to_bits())
    }

    pub fn integer(v: i64) -> Self {
        SignalData(v as u64)
    }

    pub fn boolean(v: bool) -> Self {
        SignalData(v as u64)
    }

    pub fn complex(real: f32, imag: f32) -> Self {
        SignalData(((imag.to_bits() as u64) << 32) | real.to_bits() as u64)
    }

    pub fn nan() -> Self {
        SignalData::float(f64::NAN)
    }

    pub fn zero(ty: SignalType) -> Self {
        match ty {
            SignalType::Float => SignalData::float(0.0),
            SignalType::Integer => SignalData::integer(0),
            SignalType::Boolean => SignalData::boolean(false),
            SignalType::Complex => SignalData::complex(0.0, 0.0),
        }
    }

    pub fn f(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn i(self) -> i64 {
        self.0 as i64
    }

    pub fn b(self) -> bool {
        self.0 != 0
    }

    pub fn z(self) -> Complex {
        Complex {
            real: f32::from_bits(self.0 as u32),
            imag: f32::from_bits((self.0 >> 32) as u32),
        }
    }

    /// Raw storage bits, used by binary codecs.
    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        SignalData(bits)
    }

    /// Convert a value interpreted as `from` into the representation of `to`.
    /// Lossy conversions truncate.
    pub fn cast(self, from: SignalType, to: SignalType) -> SignalData {
        if from == to {
            return self;
        }

        match to {
            SignalType::Float => {
                let v = match from {
                    SignalType::Integer => self.i() as f64,
                    SignalType::Boolean => self.b() as i64 as f64,
                    SignalType::Complex => self.z().real as f64,
                    SignalType::Float => unreachable!(),
                };
                SignalData::float(v)
            }
            SignalType::Integer => {
                let v = match from {
                    SignalType::Float => self.f() as i64,
                    SignalType::Boolean => self.b() as i64,
                    SignalType::Complex => self.z().real as i64,
                    SignalType::Integer => unreachable!(),
                };
                SignalData::integer(v)
            }
            SignalType::Boolean => {
                let v = match from {
                    SignalType::Float => self.f() != 0.0,
                    SignalType::Integer => self.i() != 0,
                    SignalType::Complex => self.z().real != 0.0,
                    SignalType::Boolean => unreachable!(),
                };
                SignalData::boolean(v)
            }
            SignalType::Complex => {
                let re = match from {
                    SignalType::Float => self.f() as f32,
                    SignalType::Integer => self.i() as f32,
                    SignalType::Boolean => self.b() as i64 as f32,
                    SignalType::Complex => unreachable!(),
                };
                SignalData::complex(re, 0.0)
            }
        }
    }

    /// Human-readable form used by the line formats.
    pub fn print_str(self, ty: SignalType) -> String {
        match ty {
            SignalType::Float => format!("{}", self.f()),
            SignalType::Integer => format!("{}", self.i()),
            SignalType::Boolean => format!("{}", self.b() as u8),
            SignalType::Complex => {
                let z = self.z();
                format!("{}{:+}i", z.real, z.imag)
            }
        }
    }

    /// Parse one token of the human-readable form. Mismatched tokens fail,
    /// they are never coerced.
    pub fn parse_str(ty: SignalType, token: &str) -> std::result::Result<SignalData, WireError> {
        let mismatch = || WireError::InvalidValueType {
            signal: String::new(),
            expected: ty.as_str(),
            token: token.to_string(),
        };

        match ty {
            SignalType::Float => token
                .parse::<f64>()
                .map(SignalData::float)
                .map_err(|_| mismatch()),
            SignalType::Integer => token
                .parse::<i64>()
                .map(SignalData::integer)
                .map_err(|_| mismatch()),
            SignalType::Boolean => match token {
                "0" | "false" => Ok(SignalData::boolean(false)),
                "1" | "true" => Ok(SignalData::boolean(true)),
                _ => Err(mismatch()),
            },
            SignalType::Complex => parse_complex(token)
                .map(|z| SignalData::complex(z.real, z.imag))
                .ok_or_else(mismatch),
        }
    }

    /// Parse a JSON scalar. Complex values use `{"real":..,"imag":..}`.
    pub fn parse_json(
        ty: SignalType,
        value: &serde_json::Value,
    ) -> std::result::Result<SignalData, WireError> {
        let mismatch = || WireError::InvalidValueType {
            signal: String::new(),
            expected: ty.as_str(),
            token: value.to_string(),
        };

        match ty {
            SignalType::Float => value
                .as_f64()
                .map(SignalData::float)
                .ok_or_else(mismatch),
            SignalType::Integer => value
                .as_i64()
                .map(SignalData::integer)
                .ok_or_else(mismatch),
            SignalType::Boolean => value
                .as_bool()
                .map(SignalData::boolean)
                .ok_or_else(mismatch),
            SignalType::Complex => {
                let obj = value.as_object().ok_or_else(mismatch)?;
                let real = obj.get("real").and_then(|v| v.as_f64()).ok_or_else(mismatch)?;
                let imag = obj.get("imag").and_then(|v| v.as_f64()).ok_or_else(mismatch)?;
                Ok(SignalData::complex(real as f32, imag as f32))
            }
        }
    }

    pub fn pack_json(self, ty: SignalType) -> serde_json::Value {
        match ty {
            SignalType::Float => serde_json::json!(self.f()),
            SignalType::Integer => serde_json::json!(self.i()),
            SignalType::Boolean => serde_json::json!(self.b()),
            SignalType::Complex => {
                let z = self.z();
                serde_json::json!({ "real": z.real, "imag": z.imag })
            }
        }
    }
}

impl fmt::Debug for SignalData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalData({:#018x})", self.0)
    }
}

/// Parse `1.5+2.25i` style complex literals.
fn parse_complex(token: &str) -> Option<Complex> {
    let body = token.strip_suffix('i')?;

    // Split at the sign of the imaginary part: the last '+'/'-' that is not
    // the leading sign and not part of an exponent.
    let bytes = body.as_bytes();
    let mut split = None;
    for pos in (1..bytes.len()).rev() {
        let c = bytes[pos];
        if (c == b'+' || c == b'-') && bytes[pos - 1] != b'e' && bytes[pos - 1] != b'E' {
            split = Some(pos);
            break;
        }
    }

    let split = split?;
    let real = body[..split].parse::<f32>().ok()?;
    let imag = body[split..].parse::<f32>().ok()?;
    Some(Complex::new(real, imag))
}

/// Descriptor of one scalar channel. Shared between producers and consumers
/// for the lifetime of every sample and list referencing it.
#[derive(Debug, Clone)]
pub struct Signal {
    pub name: String,
    pub unit: Option<String>,
    pub ty: SignalType,
    pub init: SignalData,
    pub enabled: bool,
}

impl Signal {
    pub fn new(name: impl Into<String>, ty: SignalType) -> Self {
        Signal {
            name: name.into(),
            unit: None,
            ty,
            init: SignalData::zero(ty),
            enabled: true,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_init(mut self, init: SignalData) -> Self {
        self.init = init;
        self
    }
}

/// Ordered list of signal descriptors, shared by reference.
pub type SignalList = Arc<Vec<Arc<Signal>>>;

/// Configured shape of a node's signal list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SignalsSpec {
    /// Explicit per-signal descriptors.
    List(Vec<SignalConfig>),
    /// `{ "count": N, "type": "float" }`
    Counted {
        count: usize,
        #[serde(rename = "type", default = "default_type_name")]
        ty: String,
    },
    /// Compact type-format string, e.g. `"64f"` or `"3f2i"`.
    Format(String),
}

fn default_type_name() -> String {
    "float".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    pub name: Option<String>,
    pub unit: Option<String>,
    #[serde(rename = "type", default = "default_type_name")]
    pub ty: String,
    pub init: Option<serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub const DEFAULT_SAMPLE_LENGTH: usize = 64;

/// Build a signal list from its configured shape.
pub fn signal_list_from_spec(spec: &SignalsSpec) -> Result<SignalList> {
    match spec {
        SignalsSpec::List(entries) => {
            let mut signals = Vec::with_capacity(entries.len());
            for (i, entry) in entries.iter().enumerate() {
                let ty = SignalType::from_str(&entry.ty)?;
                let name = entry
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("signal{}", i));

                let init = match &entry.init {
                    Some(v) => SignalData::parse_json(ty, v)
                        .map_err(|e| Error::config(format!("signal '{}': {}", name, e)))?,
                    None => SignalData::zero(ty),
                };

                let mut sig = Signal::new(name, ty).with_init(init);
                sig.unit = entry.unit.clone();
                sig.enabled = entry.enabled;
                signals.push(Arc::new(sig));
            }
            Ok(Arc::new(signals))
        }
        SignalsSpec::Counted { count, ty } => {
            let ty = SignalType::from_str(ty)?;
            Ok(signal_list_generate(*count, ty))
        }
        SignalsSpec::Format(fmt) => signal_list_from_fmt(fmt),
    }
}

/// Generate `count` identically typed signals named `signal0..`.
pub fn signal_list_generate(count: usize, ty: SignalType) -> SignalList {
    Arc::new(
        (0..count)
            .map(|i| Arc::new(Signal::new(format!("signal{}", i), ty)))
            .collect(),
    )
}

/// Parse a compact type-format string: runs of an optional repeat count and a
/// format char, e.g. `"64f"`, `"3f2i"`, `"fib"`.
pub fn signal_list_from_fmt(fmt: &str) -> Result<SignalList> {
    let mut signals: Vec<Arc<Signal>> = Vec::new();
    let mut repeat = 0usize;
    let mut seen_digit = false;

    for c in fmt.chars() {
        if let Some(d) = c.to_digit(10) {
            repeat = repeat * 10 + d as usize;
            seen_digit = true;
        } else {
            let ty = SignalType::from_fmt_char(c)?;
            let n = if seen_digit { repeat } else { 1 };
            for _ in 0..n {
                let i = signals.len();
                signals.push(Arc::new(Signal::new(format!("signal{}", i), ty)));
            }
            repeat = 0;
            seen_digit = false;
        }
    }

    if seen_digit {
        return Err(Error::config(format!("trailing count in format string '{}'", fmt)));
    }
    if signals.is_empty() {
        return Err(Error::config(format!("empty signal format string '{}'", fmt)));
    }

    Ok(Arc::new(signals))
}

/// Default signal list used when a node configures nothing: 64 floats.
pub fn signal_list_default() -> SignalList {
    signal_list_generate(DEFAULT_SAMPLE_LENGTH, SignalType::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_from_str() {
        assert_eq!(SignalType::from_str("float").unwrap(), SignalType::Float);
        assert_eq!(SignalType::from_str("integer").unwrap(), SignalType::Integer);
        assert_eq!(SignalType::from_str("boolean").unwrap(), SignalType::Boolean);
        assert_eq!(SignalType::from_str("complex").unwrap(), SignalType::Complex);
        assert!(SignalType::from_str("double").is_err());
    }

    #[test]
    fn test_print_parse_roundtrip() {
        let cases = [
            (SignalType::Float, SignalData::float(-1.5e-3)),
            (SignalType::Integer, SignalData::integer(-42)),
            (SignalType::Boolean, SignalData::boolean(true)),
            (SignalType::Complex, SignalData::complex(1.5, -2.25)),
        ];

        for (ty, v) in cases {
            let s = v.print_str(ty);
            let back = SignalData::parse_str(ty, &s).unwrap();
            match ty {
                SignalType::Float => assert_eq!(v.f(), back.f()),
                SignalType::Integer => assert_eq!(v.i(), back.i()),
                SignalType::Boolean => assert_eq!(v.b(), back.b()),
                SignalType::Complex => assert_eq!(v.z(), back.z()),
            }
        }
    }

    #[test]
    fn test_parse_str_mismatch() {
        assert!(SignalData::parse_str(SignalType::Integer, "1.5").is_err());
        assert!(SignalData::parse_str(SignalType::Boolean, "yes").is_err());
        assert!(SignalData::parse_str(SignalType::Float, "abc").is_err());
    }

    #[test]
    fn test_json_roundtrip_complex() {
        let v = SignalData::complex(0.5, -3.0);
        let j = v.pack_json(SignalType::Complex);
        assert_eq!(j["real"], 0.5);
        assert_eq!(j["imag"], -3.0);
        let back = SignalData::parse_json(SignalType::Complex, &j).unwrap();
        assert_eq!(v.z(), back.z());
    }

    #[test]
    fn test_json_no_coercion() {
        // An integer signal must reject fractional numbers instead of
        // truncating them.
        let v = serde_json::json!(1.5);
        assert!(SignalData::parse_json(SignalType::Integer, &v).is_err());
        let v = serde_json::json!("1");
        assert!(SignalData::parse_json(SignalType::Integer, &v).is_err());
    }

    #[test]
    fn test_cast() {
        let f = SignalData::float(3.9);
        assert_eq!(f.cast(SignalType::Float, SignalType::Integer).i(), 3);
        assert!(f.cast(SignalType::Float, SignalType::Boolean).b());

        let i = SignalData::integer(7);
        assert_eq!(i.cast(SignalType::Integer, SignalType::Float).f(), 7.0);
        assert_eq!(i.cast(SignalType::Integer, SignalType::Complex).z(), Complex::new(7.0, 0.0));
    }

    #[test]
    fn test_list_from_fmt() {
        let list = signal_list_from_fmt("3f2i").unwrap();
        assert_eq!(list.len(), 5);
        assert_eq!(list[0].ty, SignalType::Float);
        assert_eq!(list[3].ty, SignalType::Integer);

        let list = signal_list_from_fmt("64f").unwrap();
        assert_eq!(list.len(), 64);

        assert!(signal_list_from_fmt("3x").is_err());
        assert!(signal_list_from_fmt("12").is_err());
    }
}
