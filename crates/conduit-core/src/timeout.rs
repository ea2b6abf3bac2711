//! `grpc-timeout` encoding.
//!
//! Format: up to 8 ASCII digits followed by a unit character
//! (`n`, `u`, `m`, `S`, `M`, `H`).

use crate::code::Code;
use crate::error::Error;
use std::time::Duration;

/// Largest value the 8-digit wire field can carry
pub const MAX_TIMEOUT_VALUE: u64 = 99_999_999;

/// Longest timeout honored on decode, the span of a signed 64-bit nanosecond count
const MAX_DECODED_TIMEOUT: Duration = Duration::from_nanos(i64::MAX as u64);

const UNITS: [(char, Duration); 6] = [
    ('n', Duration::from_nanos(1)),
    ('u', Duration::from_micros(1)),
    ('m', Duration::from_millis(1)),
    ('S', Duration::from_secs(1)),
    ('M', Duration::from_secs(60)),
    ('H', Duration::from_secs(60 * 60)),
];

/// Invalid `grpc-timeout` header
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    #[error("timeout {0:?} has invalid unit")]
    InvalidUnit(String),

    #[error("invalid timeout {0:?}")]
    InvalidValue(String),

    #[error("timeout {0:?} is too long")]
    TooLong(String),
}

impl From<TimeoutError> for Error {
    fn from(err: TimeoutError) -> Self {
        Error::new(Code::InvalidArgument, format!("protocol error: {err}"))
    }
}

/// Encode a remaining duration for the wire.
///
/// Uses the finest unit whose count fits in 8 digits. Returns `None` when
/// even the hour count does not fit, meaning the call is effectively
/// unbounded and no header should be sent.
pub fn encode_timeout(timeout: Duration) -> Option<String> {
    if timeout.is_zero() {
        return Some("0n".to_string());
    }
    UNITS.iter().find_map(|(unit, size)| {
        let count = timeout.as_nanos() / size.as_nanos();
        (count <= u128::from(MAX_TIMEOUT_VALUE)).then(|| format!("{count}{unit}"))
    })
}

/// Decode a `grpc-timeout` value. An absent or empty header means no timeout,
/// and so does one too long to count in signed 64-bit nanoseconds.
pub fn decode_timeout(value: Option<&str>) -> Result<Option<Duration>, TimeoutError> {
    let value = match value {
        None | Some("") => return Ok(None),
        Some(value) => value,
    };
    let Some(unit_char) = value.chars().last() else {
        return Ok(None);
    };
    let size = UNITS
        .iter()
        .find(|(unit, _)| *unit == unit_char)
        .map(|(_, size)| *size)
        .ok_or_else(|| TimeoutError::InvalidUnit(value.to_string()))?;
    let digits = &value[..value.len() - unit_char.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|c| c.is_ascii_digit()) {
        return Err(TimeoutError::InvalidValue(value.to_string()));
    }
    if digits.len() > 8 {
        return Err(TimeoutError::TooLong(value.to_string()));
    }
    let count: u32 = digits
        .parse()
        .map_err(|_| TimeoutError::InvalidValue(value.to_string()))?;
    let timeout = size * count;
    if timeout > MAX_DECODED_TIMEOUT {
        return Ok(None);
    }
    Ok(Some(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_picks_finest_unit() {
        assert_eq!(encode_timeout(Duration::ZERO).unwrap(), "0n");
        assert_eq!(encode_timeout(Duration::from_nanos(500)).unwrap(), "500n");
        assert_eq!(encode_timeout(Duration::from_millis(50)).unwrap(), "50000000n");
        assert_eq!(encode_timeout(Duration::from_secs(1)).unwrap(), "1000000u");
        assert_eq!(encode_timeout(Duration::from_secs(3600)).unwrap(), "3600000m");
        assert_eq!(
            encode_timeout(Duration::from_secs(60 * 60 * 24 * 365 * 100)).unwrap(),
            "52560000M"
        );
    }

    #[test]
    fn test_encode_beyond_ceiling() {
        let hours = Duration::from_secs(3600);
        assert!(encode_timeout(hours * 99_999_999).is_some());
        assert!(encode_timeout(hours * 100_000_000).is_none());
        assert!(encode_timeout(Duration::MAX).is_none());
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode_timeout(None).unwrap(), None);
        assert_eq!(decode_timeout(Some("")).unwrap(), None);
        assert_eq!(decode_timeout(Some("10S")).unwrap(), Some(Duration::from_secs(10)));
        assert_eq!(decode_timeout(Some("3M")).unwrap(), Some(Duration::from_secs(180)));
        assert_eq!(decode_timeout(Some("99999999M")).unwrap(), Some(Duration::from_secs(60) * 99_999_999));
    }

    #[test]
    fn test_decode_hours_past_ceiling() {
        assert_eq!(decode_timeout(Some("2562047H")).unwrap(), Some(Duration::from_secs(3600) * 2_562_047));
        assert_eq!(decode_timeout(Some("2562048H")).unwrap(), None);
        assert_eq!(decode_timeout(Some("99999999H")).unwrap(), None);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode_timeout(Some("10")), Err(TimeoutError::InvalidUnit(_))));
        assert!(matches!(decode_timeout(Some("10x")), Err(TimeoutError::InvalidUnit(_))));
        assert!(matches!(decode_timeout(Some("S")), Err(TimeoutError::InvalidValue(_))));
        assert!(matches!(decode_timeout(Some("-1S")), Err(TimeoutError::InvalidValue(_))));
        assert!(matches!(decode_timeout(Some("1.5S")), Err(TimeoutError::InvalidValue(_))));
        assert!(matches!(decode_timeout(Some("123456789m")), Err(TimeoutError::TooLong(_))));
        let err: Error = decode_timeout(Some("garbage")).unwrap_err().into();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    proptest! {
        #[test]
        fn prop_round_trip_within_one_unit(nanos in 0u64..(3600u64 * 1_000_000_000 * 10_000)) {
            let original = Duration::from_nanos(nanos);
            let encoded = encode_timeout(original).unwrap();
            let unit = encoded.chars().last().unwrap();
            let step = UNITS.iter().find(|(c, _)| *c == unit).unwrap().1;
            let decoded = decode_timeout(Some(encoded.as_str())).unwrap().unwrap();
            prop_assert!(decoded <= original);
            prop_assert!(original - decoded < step);
        }
    }
}
