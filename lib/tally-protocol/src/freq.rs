//! Bucket frequencies: a unit plus a multiplier, e.g. `5m` for five-minute
//! buckets. Sample timestamps are aligned to bucket starts with floored
//! division, so every bucket covers `[start, start + span)`.

use std::fmt;
use std::str::FromStr;

use snafu::Snafu;

use crate::buf::{CorruptSnafu, DecodeError, EncodeError, Reader, Writer};

/// Calendar unit of a frequency. On the wire this is a single byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FreqUnit {
    Second = 0,
    Minute = 1,
    Hour = 2,
    Day = 3,
    Month = 4,
    Year = 5,
}

impl FreqUnit {
    pub fn from_byte(b: u8) -> Option<FreqUnit> {
        Some(match b {
            0 => FreqUnit::Second,
            1 => FreqUnit::Minute,
            2 => FreqUnit::Hour,
            3 => FreqUnit::Day,
            4 => FreqUnit::Month,
            5 => FreqUnit::Year,
            _ => return None,
        })
    }

    /// Single-letter suffix used in storage file names. Note that `Month`
    /// collides with `Minute` here; the naming scheme is inherited and the
    /// ambiguity is tolerated because month-grained files are never written.
    pub fn suffix(&self) -> char {
        match self {
            FreqUnit::Second => 's',
            FreqUnit::Minute => 'm',
            FreqUnit::Hour => 'h',
            FreqUnit::Day => 'd',
            FreqUnit::Month => 'm',
            FreqUnit::Year => 'y',
        }
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum FrequencyError {
    /// Month and year buckets have no fixed millisecond length.
    #[snafu(display("no fixed bucket length for {unit:?} frequencies"))]
    Unsupported { unit: FreqUnit },

    #[snafu(display("invalid frequency {input:?}, expected e.g. \"30s\", \"5m\", \"1h\""))]
    Invalid { input: String },
}

/// A bucket length: `count` multiples of `unit`, `count` in `1..=255`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Frequency {
    pub unit: FreqUnit,
    pub count: u8,
}

impl Frequency {
    pub const fn new(unit: FreqUnit, count: u8) -> Self {
        Frequency { unit, count }
    }

    /// Length of one bucket in milliseconds. Fails for month/year, which do
    /// not have a fixed length.
    pub fn span_millis(&self) -> Result<i64, FrequencyError> {
        let base: i64 = match self.unit {
            FreqUnit::Second => 1_000,
            FreqUnit::Minute => 60_000,
            FreqUnit::Hour => 3_600_000,
            FreqUnit::Day => 86_400_000,
            FreqUnit::Month | FreqUnit::Year => {
                return UnsupportedSnafu { unit: self.unit }.fail()
            }
        };
        Ok(base * i64::from(self.count))
    }

    /// Start of the bucket containing `ts`: `floor(ts / span) * span`.
    /// Floored, not truncated, so pre-epoch timestamps still align to the
    /// start of their bucket rather than its end.
    pub fn bucket_start(&self, ts: i64) -> Result<i64, FrequencyError> {
        let span = self.span_millis()?;
        Ok(ts.div_euclid(span) * span)
    }

    pub fn parse(reader: &mut Reader<'_>) -> Result<Frequency, DecodeError> {
        let offset = reader.position();
        let ftype = reader.get_u8()?;
        let count = reader.get_u8()?;

        let unit = FreqUnit::from_byte(ftype).ok_or_else(|| {
            CorruptSnafu {
                offset,
                reason: "frequency unit byte out of range",
            }
            .build()
        })?;
        if count == 0 {
            return CorruptSnafu {
                offset,
                reason: "frequency count is zero",
            }
            .fail();
        }

        Ok(Frequency { unit, count })
    }

    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        writer.put_u8(self.unit as u8)?;
        writer.put_u8(self.count)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

impl FromStr for Frequency {
    type Err = FrequencyError;

    /// Parse configuration strings like `"5m"`. Month and year are not
    /// accepted from configuration; nothing buckets at that grain.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FrequencyError::Invalid { input: s.into() };

        let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        let (digits, rest) = s.split_at(split);
        let count: u8 = digits.parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }

        let unit = match rest {
            "s" | "S" => FreqUnit::Second,
            "m" | "M" => FreqUnit::Minute,
            "h" | "H" => FreqUnit::Hour,
            "d" | "D" => FreqUnit::Day,
            _ => return Err(invalid()),
        };

        Ok(Frequency { unit, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_start_aligns_down() {
        let one_minute = Frequency::new(FreqUnit::Minute, 1);
        assert_eq!(one_minute.bucket_start(60_030).unwrap(), 60_000);
        assert_eq!(one_minute.bucket_start(59_999).unwrap(), 0);

        let five_minutes = Frequency::new(FreqUnit::Minute, 5);
        assert_eq!(five_minutes.bucket_start(7 * 60_000).unwrap(), 5 * 60_000);

        let hour = Frequency::new(FreqUnit::Hour, 1);
        assert_eq!(hour.bucket_start(3_600_001).unwrap(), 3_600_000);
    }

    #[test]
    fn bucket_start_floors_before_the_epoch() {
        let one_minute = Frequency::new(FreqUnit::Minute, 1);
        assert_eq!(one_minute.bucket_start(-30_000).unwrap(), -60_000);
        assert_eq!(one_minute.bucket_start(-60_000).unwrap(), -60_000);
        assert_eq!(one_minute.bucket_start(-60_001).unwrap(), -120_000);
    }

    #[test]
    fn month_and_year_have_no_span() {
        assert!(Frequency::new(FreqUnit::Month, 1).span_millis().is_err());
        assert!(Frequency::new(FreqUnit::Year, 1).span_millis().is_err());
    }

    #[test]
    fn parses_config_strings() {
        assert_eq!(
            "5m".parse::<Frequency>().unwrap(),
            Frequency::new(FreqUnit::Minute, 5)
        );
        assert_eq!(
            "30S".parse::<Frequency>().unwrap(),
            Frequency::new(FreqUnit::Second, 30)
        );
        assert!("".parse::<Frequency>().is_err());
        assert!("m".parse::<Frequency>().is_err());
        assert!("0m".parse::<Frequency>().is_err());
        assert!("5x".parse::<Frequency>().is_err());
        assert!("999m".parse::<Frequency>().is_err());
    }

    #[test]
    fn display_matches_file_suffix() {
        assert_eq!(Frequency::new(FreqUnit::Minute, 1).to_string(), "1m");
        assert_eq!(Frequency::new(FreqUnit::Second, 30).to_string(), "30s");
    }
}
