use std::sync::LazyLock;
use chrono::{Days, Months, NaiveDate};
use regex::Regex;

use super::error::DateOffsetError;

static OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(-?)([0-9]+)([dwmy])$").expect("offset regex is valid")
});

/// Returns true when `value` looks like a relative date token such as `-1m`.
pub fn is_offset_notation(value: &str) -> bool {
  OFFSET_RE.is_match(value)
}

/// Resolves an offset token (`-1m`, `3d`, `2w`, `1y`) against `reference` and
/// returns the ISO `yyyy-MM-dd` date.
///
/// Month and year steps land on the same day of the target month, clamped to
/// that month's last day when it is shorter.
pub fn convert_to_exact_date(notation: &str, reference: NaiveDate) -> Result<String, DateOffsetError> {
  let caps = OFFSET_RE
    .captures(notation)
    .ok_or_else(|| DateOffsetError::InvalidFormat(notation.to_string()))?;

  let negative = &caps[1] == "-";
  let amount: u32 = caps[2]
    .parse()
    .map_err(|_| DateOffsetError::OutOfRange(notation.to_string()))?;

  let shifted = match &caps[3] {
    "d" => shift_days(reference, amount as u64, negative),
    "w" => shift_days(reference, amount as u64 * 7, negative),
    "m" => shift_months(reference, amount, negative),
    "y" => amount.checked_mul(12).and_then(|months| shift_months(reference, months, negative)),
    _ => None,
  };

  shifted
    .map(|date| date.format("%Y-%m-%d").to_string())
    .ok_or_else(|| DateOffsetError::OutOfRange(notation.to_string()))
}

fn shift_days(date: NaiveDate, days: u64, negative: bool) -> Option<NaiveDate> {
  if negative {
    date.checked_sub_days(Days::new(days))
  } else {
    date.checked_add_days(Days::new(days))
  }
}

fn shift_months(date: NaiveDate, months: u32, negative: bool) -> Option<NaiveDate> {
  if negative {
    date.checked_sub_months(Months::new(months))
  } else {
    date.checked_add_months(Months::new(months))
  }
}
