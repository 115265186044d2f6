//! Durations written in Go's `time.Duration` notation, as used in Kubernetes
//! manifests (`90s`, `1h30m`, `1.5h`).

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A non-negative duration that parses and prints in Go notation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GoDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),

    #[error("durations must not be negative")]
    Negative,

    #[error("empty duration")]
    Empty,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

impl GoDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for GoDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration(duration): GoDuration) -> Self {
        duration
    }
}

fn unit_base(unit: &str) -> Result<Duration, ParseError> {
    const MINUTE: Duration = Duration::from_secs(60);
    Ok(match unit {
        "ns" => Duration::from_nanos(1),
        // U+00B5 is the micro sign and U+03BC is the Greek letter mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => MINUTE,
        "h" => MINUTE * 60,
        _ => return Err(ParseError::InvalidUnit),
    })
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = match s.strip_prefix('-') {
            Some("0") => return Ok(Self::default()),
            Some(_) => return Err(ParseError::Negative),
            None => s.strip_prefix('+').unwrap_or(s),
        };
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }
        if rest == "0" {
            return Ok(Self::default());
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            total += unit_base(unit)?.mul_f64(value.parse::<f64>()?);
            rest = tail;
        }
        Ok(Self(total))
    }
}

/// Writes `nanos / scale` with a trimmed decimal fraction.
fn write_scaled(f: &mut fmt::Formatter<'_>, nanos: u128, scale: u128, digits: usize) -> fmt::Result {
    let (whole, frac) = (nanos / scale, nanos % scale);
    write!(f, "{whole}")?;
    if frac != 0 {
        let frac = format!("{frac:0digits$}");
        write!(f, ".{}", frac.trim_end_matches('0'))?;
    }
    Ok(())
}

/// Matches Go's `time.Duration.String()`, e.g. `24h0m0s`, `1.5s`, `250ms`.
impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }

        if nanos < 1_000 {
            return write!(f, "{nanos}ns");
        }
        if nanos < 1_000_000 {
            write_scaled(f, nanos, 1_000, 3)?;
            return f.write_str("\u{00b5}s");
        }
        if nanos < 1_000_000_000 {
            write_scaled(f, nanos, 1_000_000, 6)?;
            return f.write_str("ms");
        }

        let secs = self.0.as_secs();
        let (hours, minutes, secs) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        let sub = u128::from(secs) * 1_000_000_000 + u128::from(self.0.subsec_nanos());
        write_scaled(f, sub, 1_000_000_000, 9)?;
        f.write_str("s")
    }
}

impl Serialize for GoDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GoDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = GoDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration.String()` format")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<GoDuration>().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}
