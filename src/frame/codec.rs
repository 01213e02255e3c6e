//! Fixed-width measurement frame grammar.
//!
//! A frame on the wire is plain ASCII:
//!
//! ```text
//! 089 [+-]DD.DD x5 [+-]DD.DDDDDDD [+-]DDD.DDDD x2 980
//! ```
//!
//! Five 2-decimal temperatures, one 7-decimal temperature and two 4-decimal distances,
//! bounded by the literal `089` start marker and `980` end marker. There is no checksum,
//! so the width grammar is the only integrity check: a candidate that deviates in any
//! position is rejected as a whole.
//!
//! Values are kept as scaled integers ([`Fixed`]) so that rounding to the canonical
//! 4-decimal output never goes through binary floating point.
use thiserror::Error;

/// Literal start-of-frame marker.
pub const START_MARKER: &[u8] = b"089";
/// Literal end-of-frame marker.
pub const END_MARKER: &[u8] = b"980";

/// Number of temperature fields carried by one frame.
pub const TEMPERATURE_COUNT: usize = 6;
/// Number of distance fields carried by one frame.
pub const DISTANCE_COUNT: usize = 2;

/// Fractional digits used by the canonical output line.
pub const OUTPUT_SCALE: u32 = 4;
const OUTPUT_INT_WIDTH: usize = 2;

/// `(integer digits, fractional digits)` for each field, in wire order.
const FIELD_LAYOUT: [(usize, u32); TEMPERATURE_COUNT + DISTANCE_COUNT] = [
    (2, 2),
    (2, 2),
    (2, 2),
    (2, 2),
    (2, 2),
    (2, 7),
    (3, 4),
    (3, 4),
];

const fn field_width(int_digits: usize, frac_digits: u32) -> usize {
    // sign + integer digits + '.' + fraction
    1 + int_digits + 1 + frac_digits as usize
}

const fn payload_len() -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < FIELD_LAYOUT.len() {
        total += field_width(FIELD_LAYOUT[i].0, FIELD_LAYOUT[i].1);
        i += 1;
    }
    total
}

/// Total length of a well-formed frame including both markers.
pub const FRAME_LEN: usize = START_MARKER.len() + payload_len() + END_MARKER.len();

/// Reasons a candidate substring is not a frame.
///
/// All variants are ordinary line noise (torn frames, resets mid-transmission) and never
/// affect the link itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("candidate is not bounded by the 089/980 markers")]
    MissingMarkers,
    #[error("candidate is {found} bytes, a frame is {expected}")]
    WrongLength { expected: usize, found: usize },
    #[error("field {index} is not a signed fixed-point value: {raw:?}")]
    InvalidField { index: usize, raw: String },
}

/// Signed fixed-point number: `units / 10^scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fixed {
    units: i64,
    scale: u32,
}

impl Fixed {
    pub const fn new(units: i64, scale: u32) -> Self {
        Self { units, scale }
    }

    pub fn units(self) -> i64 {
        self.units
    }

    pub fn scale(self) -> u32 {
        self.scale
    }

    /// Parse exactly `[+-]` + `int_digits` digits + `.` + `frac_digits` digits.
    ///
    /// The sign is mandatory and no whitespace is tolerated; anything else is `None`.
    pub fn parse(text: &str, int_digits: usize, frac_digits: u32) -> Option<Self> {
        let bytes = text.as_bytes();
        if bytes.len() != field_width(int_digits, frac_digits) {
            return None;
        }
        let negative = match bytes[0] {
            b'+' => false,
            b'-' => true,
            _ => return None,
        };
        if bytes[1 + int_digits] != b'.' {
            return None;
        }
        let mut units: i64 = 0;
        for (i, &b) in bytes[1..].iter().enumerate() {
            if i == int_digits {
                continue;
            }
            if !b.is_ascii_digit() {
                return None;
            }
            units = units * 10 + i64::from(b - b'0');
        }
        Some(Self {
            units: if negative { -units } else { units },
            scale: frac_digits,
        })
    }

    /// Change the number of fractional digits, rounding half away from zero.
    pub fn rescale(self, scale: u32) -> Self {
        if scale >= self.scale {
            let factor = 10i64.pow(scale - self.scale);
            return Self::new(self.units * factor, scale);
        }
        let divisor = 10i64.pow(self.scale - scale);
        let quotient = self.units / divisor;
        let remainder = self.units % divisor;
        let units = if remainder.abs() * 2 >= divisor {
            quotient + self.units.signum()
        } else {
            quotient
        };
        Self::new(units, scale)
    }

    pub fn to_f64(self) -> f64 {
        self.units as f64 / 10f64.powi(self.scale as i32)
    }

    /// Render with an explicit sign and at least `int_width` integer digits.
    /// Zero (including a value that rounded to zero from below) is always `+`.
    pub fn render(self, int_width: usize) -> String {
        let sign = if self.units < 0 { '-' } else { '+' };
        let magnitude = self.units.unsigned_abs();
        let pow = 10u64.pow(self.scale);
        let int_part = magnitude / pow;
        if self.scale == 0 {
            return format!("{sign}{int_part:0iw$}", iw = int_width);
        }
        let frac_part = magnitude % pow;
        format!(
            "{sign}{int_part:0iw$}.{frac_part:0fw$}",
            iw = int_width,
            fw = self.scale as usize
        )
    }

    /// Canonical on-disk representation: 4 fractional digits, `+00.0000` style.
    pub fn canonical(self) -> String {
        self.rescale(OUTPUT_SCALE).render(OUTPUT_INT_WIDTH)
    }
}

/// One decoded frame. Only produced by [`try_decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFields {
    pub temperatures: [Fixed; TEMPERATURE_COUNT],
    pub distances: [Fixed; DISTANCE_COUNT],
}

impl FrameFields {
    pub fn temperatures_f64(&self) -> [f64; TEMPERATURE_COUNT] {
        self.temperatures.map(Fixed::to_f64)
    }

    pub fn distances_f64(&self) -> [f64; DISTANCE_COUNT] {
        self.distances.map(Fixed::to_f64)
    }
}

/// Validate and decode one candidate, markers included.
pub fn try_decode(candidate: &str) -> Result<FrameFields, DecodeError> {
    let bytes = candidate.as_bytes();
    if !bytes.starts_with(START_MARKER) || !bytes.ends_with(END_MARKER) {
        return Err(DecodeError::MissingMarkers);
    }
    if bytes.len() != FRAME_LEN {
        return Err(DecodeError::WrongLength {
            expected: FRAME_LEN,
            found: bytes.len(),
        });
    }

    let mut values = [Fixed::new(0, 0); TEMPERATURE_COUNT + DISTANCE_COUNT];
    let mut pos = START_MARKER.len();
    for (index, &(int_digits, frac_digits)) in FIELD_LAYOUT.iter().enumerate() {
        let width = field_width(int_digits, frac_digits);
        let raw = &bytes[pos..pos + width];
        values[index] = std::str::from_utf8(raw)
            .ok()
            .and_then(|text| Fixed::parse(text, int_digits, frac_digits))
            .ok_or_else(|| DecodeError::InvalidField {
                index,
                raw: String::from_utf8_lossy(raw).into_owned(),
            })?;
        pos += width;
    }

    let mut temperatures = [Fixed::new(0, 0); TEMPERATURE_COUNT];
    temperatures.copy_from_slice(&values[..TEMPERATURE_COUNT]);
    let mut distances = [Fixed::new(0, 0); DISTANCE_COUNT];
    distances.copy_from_slice(&values[TEMPERATURE_COUNT..]);
    Ok(FrameFields {
        temperatures,
        distances,
    })
}

/// The six temperatures as the canonical comma-joined output line (no newline).
pub fn format_line(fields: &FrameFields) -> String {
    fields
        .temperatures
        .iter()
        .map(|t| t.canonical())
        .collect::<Vec<_>>()
        .join(",")
}

/// Render fields back into the wire grammar. `None` if a value does not fit its field.
pub fn encode_frame(fields: &FrameFields) -> Option<String> {
    let mut out = String::with_capacity(FRAME_LEN);
    out.push_str(std::str::from_utf8(START_MARKER).ok()?);
    let values = fields.temperatures.iter().chain(fields.distances.iter());
    for (value, &(int_digits, frac_digits)) in values.zip(FIELD_LAYOUT.iter()) {
        let rendered = value.rescale(frac_digits).render(int_digits);
        if rendered.len() != field_width(int_digits, frac_digits) {
            return None;
        }
        out.push_str(&rendered);
    }
    out.push_str(std::str::from_utf8(END_MARKER).ok()?);
    Some(out)
}
