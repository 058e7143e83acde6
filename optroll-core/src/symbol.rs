//! Parsing and formatting for exchange option symbols.
//!
//! The wire format is `BASE-DDMMMYY-STRIKE-{C|P}`, e.g. `BTC-26DEC25-100000-C`.
//! Settlement happens at 08:00 UTC on the expiry day.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Hour of day (UTC) at which options settle.
const SETTLEMENT_HOUR: u32 = 8;

/// Errors produced when interpreting an option symbol string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("invalid option symbol format: '{0}'")]
    Format(String),
    #[error("invalid expiry code '{0}'")]
    Expiry(String),
    #[error("invalid strike '{0}'")]
    Strike(String),
}

/// Call or put classification of an option contract.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OptionKind {
    Call,
    Put,
}

impl OptionKind {
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Call => "C",
            Self::Put => "P",
        }
    }
}

/// Structured form of an exchange option symbol.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OptionSymbol {
    pub base: String,
    pub expiry: NaiveDate,
    pub strike: Decimal,
    pub kind: OptionKind,
}

impl OptionSymbol {
    /// The canonical settlement instant for this contract.
    #[must_use]
    pub fn expiry_instant(&self) -> DateTime<Utc> {
        let time = NaiveTime::from_hms_opt(SETTLEMENT_HOUR, 0, 0).expect("valid settlement time");
        DateTime::from_naive_utc_and_offset(self.expiry.and_time(time), Utc)
    }

    /// Produce the sibling contract at a different strike.
    #[must_use]
    pub fn with_strike(&self, strike: Decimal) -> Self {
        Self {
            strike,
            ..self.clone()
        }
    }
}

impl fmt::Display for OptionSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use chrono::Datelike;
        let month = MONTHS[self.expiry.month0() as usize];
        let year = self.expiry.year() % 100;
        write!(
            f,
            "{}-{}{}{:02}-{}-{}",
            self.base,
            self.expiry.day(),
            month,
            year,
            self.strike.normalize(),
            self.kind.suffix()
        )
    }
}

impl FromStr for OptionSymbol {
    type Err = SymbolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split('-').collect();
        let [base, expiry_code, strike, kind] = parts[..] else {
            return Err(SymbolError::Format(value.to_string()));
        };
        if base.is_empty() || !base.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(SymbolError::Format(value.to_string()));
        }
        let kind = match kind {
            "C" => OptionKind::Call,
            "P" => OptionKind::Put,
            _ => return Err(SymbolError::Format(value.to_string())),
        };
        let expiry = parse_expiry(expiry_code)?;
        let strike = Decimal::from_str(strike)
            .map_err(|_| SymbolError::Strike(strike.to_string()))
            .and_then(|s| {
                if s.is_sign_negative() {
                    Err(SymbolError::Strike(strike.to_string()))
                } else {
                    Ok(s)
                }
            })?;
        Ok(Self {
            base: base.to_string(),
            expiry,
            strike,
            kind,
        })
    }
}

/// Decode a `DDMMMYY` expiry code (day may be one or two digits).
fn parse_expiry(code: &str) -> Result<NaiveDate, SymbolError> {
    let digits = code.chars().take_while(|c| c.is_ascii_digit()).count();
    if !(1..=2).contains(&digits) || code.len() != digits + 5 {
        return Err(SymbolError::Expiry(code.to_string()));
    }
    let day: u32 = code[..digits]
        .parse()
        .map_err(|_| SymbolError::Expiry(code.to_string()))?;
    let month_code = &code[digits..digits + 3];
    let month = MONTHS
        .iter()
        .position(|m| *m == month_code)
        .ok_or_else(|| SymbolError::Expiry(code.to_string()))? as u32
        + 1;
    let year: i32 = code[digits + 3..]
        .parse()
        .map_err(|_| SymbolError::Expiry(code.to_string()))?;
    NaiveDate::from_ymd_opt(2000 + year, month, day)
        .ok_or_else(|| SymbolError::Expiry(code.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_call_symbol() {
        let sym: OptionSymbol = "BTC-26DEC25-100000-C".parse().unwrap();
        assert_eq!(sym.base, "BTC");
        assert_eq!(sym.expiry, NaiveDate::from_ymd_opt(2025, 12, 26).unwrap());
        assert_eq!(sym.strike, dec!(100000));
        assert_eq!(sym.kind, OptionKind::Call);
    }

    #[test]
    fn parses_single_digit_day() {
        let sym: OptionSymbol = "ETH-7FEB26-3400-P".parse().unwrap();
        assert_eq!(sym.expiry, NaiveDate::from_ymd_opt(2026, 2, 7).unwrap());
        assert_eq!(sym.kind, OptionKind::Put);
    }

    #[test]
    fn display_round_trips() {
        for raw in ["BTC-26DEC25-100000-C", "ETH-7FEB26-3400-P", "SOL-1JAN27-95-C"] {
            let sym: OptionSymbol = raw.parse().unwrap();
            assert_eq!(sym.to_string(), raw);
        }
    }

    #[test]
    fn settlement_is_eight_utc() {
        let sym: OptionSymbol = "ETH-30JAN26-3400-C".parse().unwrap();
        let instant = sym.expiry_instant();
        assert_eq!(instant.hour(), 8);
        assert_eq!(instant.minute(), 0);
        assert_eq!(
            instant.date_naive(),
            NaiveDate::from_ymd_opt(2026, 1, 30).unwrap()
        );
    }

    #[test]
    fn with_strike_keeps_remaining_fields() {
        let sym: OptionSymbol = "BTC-26DEC25-100000-C".parse().unwrap();
        let next = sym.with_strike(dec!(101000));
        assert_eq!(next.to_string(), "BTC-26DEC25-101000-C");
    }

    #[test]
    fn rejects_malformed_symbols() {
        for raw in [
            "BTCUSDT",
            "BTC-26DEC25-100000",
            "BTC-26DEC25-100000-X",
            "BTC-99ZZZ25-100000-C",
            "btc-26DEC25-100000-C",
            "BTC-26DEC25--100000-C",
        ] {
            assert!(raw.parse::<OptionSymbol>().is_err(), "accepted {raw}");
        }
    }
}
