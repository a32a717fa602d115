use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Fractional digits of the stable-unit representation.
pub const FRACTIONAL_DIGITS: u32 = 6;

/// Micro-units per whole token (10^6).
pub const MICROS_PER_UNIT: i128 = 1_000_000;

/// A stablecoin amount in micro-units (6 fractional digits).
///
/// All monetary arithmetic in the engine runs on this integer representation.
/// i128 leaves headroom for accrual intermediates (principal · bps · seconds)
/// far beyond the supported range of 10^12 stable-units over 10 years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_micros(micros: i128) -> Self {
        Amount(micros)
    }

    pub const fn micros(&self) -> i128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Multiply by a basis-point fraction, rounding down.
    pub fn mul_bps_floor(&self, bps: u32) -> Amount {
        Amount(self.0 * bps as i128 / 10_000)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    /// Parse a decimal string like `"1000.50"` with up to 6 fractional digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if digits.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountParseError::Empty);
        }
        if frac_part.len() > FRACTIONAL_DIGITS as usize {
            return Err(AmountParseError::TooManyFractionalDigits(frac_part.len()));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AmountParseError::InvalidDigit);
        }

        let int: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| AmountParseError::Overflow)?
        };
        let mut frac: i128 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| AmountParseError::Overflow)?
        };
        for _ in frac_part.len()..FRACTIONAL_DIGITS as usize {
            frac *= 10;
        }

        let micros = int
            .checked_mul(MICROS_PER_UNIT)
            .and_then(|v| v.checked_add(frac))
            .ok_or(AmountParseError::Overflow)?;

        Ok(Amount(if negative { -micros } else { micros }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abs = self.0.unsigned_abs();
        let int = abs / MICROS_PER_UNIT as u128;
        let frac = abs % MICROS_PER_UNIT as u128;
        if self.0 < 0 {
            write!(f, "-")?;
        }
        if frac == 0 {
            write!(f, "{int}")
        } else {
            let frac = format!("{frac:06}");
            write!(f, "{int}.{}", frac.trim_end_matches('0'))
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AmountParseError {
    #[error("empty amount string")]
    Empty,
    #[error("amount has {0} fractional digits, max is 6")]
    TooManyFractionalDigits(usize),
    #[error("amount contains a non-digit character")]
    InvalidDigit,
    #[error("amount out of range")]
    Overflow,
}

// Wire representation is the decimal string, matching the ledger payloads.

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl schemars::JsonSchema for Amount {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "Amount".into()
    }

    fn json_schema(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
        schemars::json_schema!({
            "type": "string",
            "description": "Decimal stable-unit amount with up to 6 fractional digits",
            "pattern": "^-?[0-9]+(\\.[0-9]{1,6})?$"
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_and_fractional() {
        assert_eq!("1".parse::<Amount>().unwrap(), Amount::from_micros(1_000_000));
        assert_eq!("1000.50".parse::<Amount>().unwrap(), Amount::from_micros(1_000_500_000));
        assert_eq!("0.000001".parse::<Amount>().unwrap(), Amount::from_micros(1));
        assert_eq!("-2.5".parse::<Amount>().unwrap(), Amount::from_micros(-2_500_000));
        assert_eq!(".5".parse::<Amount>().unwrap(), Amount::from_micros(500_000));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("".parse::<Amount>(), Err(AmountParseError::Empty));
        assert_eq!(
            "1.1234567".parse::<Amount>(),
            Err(AmountParseError::TooManyFractionalDigits(7))
        );
        assert_eq!("1,5".parse::<Amount>(), Err(AmountParseError::InvalidDigit));
        assert_eq!("1e6".parse::<Amount>(), Err(AmountParseError::InvalidDigit));
    }

    #[test]
    fn display_round_trips() {
        for micros in [0i128, 1, 999_999, 1_000_000, 40_000, -1_234_560, 123_456_789_012] {
            let a = Amount::from_micros(micros);
            let back: Amount = a.to_string().parse().unwrap();
            assert_eq!(a, back, "round trip for {micros}");
        }
        assert_eq!(Amount::from_micros(1_000_000).to_string(), "1");
        assert_eq!(Amount::from_micros(1_500_000).to_string(), "1.5");
        assert_eq!(Amount::from_micros(40_000).to_string(), "0.04");
    }

    #[test]
    fn serde_uses_decimal_string() {
        let a = Amount::from_micros(1_000_500_000);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"1000.5\"");
        let back: Amount = serde_json::from_str("\"1000.5\"").unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn mul_bps_floors() {
        assert_eq!(Amount::from_micros(40_000).mul_bps_floor(7_000).micros(), 28_000);
        assert_eq!(Amount::from_micros(40_000).mul_bps_floor(2_000).micros(), 8_000);
        assert_eq!(Amount::from_micros(99).mul_bps_floor(7_000).micros(), 69);
        assert_eq!(Amount::from_micros(1).mul_bps_floor(7_000).micros(), 0);
    }
}
