//! Serial number format: `AQS-[Region]-M[Model]-[Year]-[Unit]`, e.g. `AQS-EU-M01-25-000001`

use std::str::FromStr;

const PREFIX: &str = "AQS";
const SERIAL_LEN: usize = 20;
// Positions of the dashes in a complete serial number
const DASHES: [usize; 4] = [3, 6, 10, 13];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialNumberError {
    #[error("serial number must be 20 characters, got {0}")]
    Length(usize),
    #[error("serial number must start with AQS-")]
    Prefix,
    #[error("invalid {field} in serial number: {value:?}")]
    Field { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerialNumber {
    region: String,
    model: u8,
    year: u8,
    unit: u32,
}

impl SerialNumber {
    /// Two letter region code, e.g. `EU`, `US`
    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn model(&self) -> u8 {
        self.model
    }

    /// Two digit manufacturing year, `25` for 2025
    pub fn year(&self) -> u8 {
        self.year
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn field(field: &'static str, value: &str) -> SerialNumberError {
    SerialNumberError::Field { field, value: value.to_string() }
}

impl FromStr for SerialNumber {
    type Err = SerialNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SERIAL_LEN {
            return Err(SerialNumberError::Length(s.len()));
        }
        let parts: Vec<&str> = s.split('-').collect();
        let [prefix, region, model, year, unit] = parts.as_slice() else {
            return Err(field("layout", s));
        };
        if *prefix != PREFIX {
            return Err(SerialNumberError::Prefix);
        }
        if region.len() != 2 || !region.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(field("region", region));
        }
        let model = match model.strip_prefix('M') {
            Some(digits) if digits.len() == 2 && all_digits(digits) => digits,
            _ => return Err(field("model", model)),
        };
        if year.len() != 2 || !all_digits(year) {
            return Err(field("year", year));
        }
        if unit.len() != 6 || !all_digits(unit) {
            return Err(field("unit", unit));
        }

        Ok(Self {
            region: region.to_string(),
            model: model.parse().map_err(|_| field("model", model))?,
            year: year.parse().map_err(|_| field("year", year))?,
            unit: unit.parse().map_err(|_| field("unit", unit))?,
        })
    }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{PREFIX}-{}-M{:02}-{:02}-{:06}",
            self.region, self.model, self.year, self.unit
        )
    }
}

/// Formats a partially typed serial number: upper-cases, drops anything that
/// is not a letter, digit or dash, inserts the dashes the user skipped and
/// truncates to the full serial length.
pub fn format_serial_input(input: &str) -> String {
    let mut formatted: Vec<char> = input
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    for dash in DASHES {
        if formatted.len() > dash && formatted[dash] != '-' {
            formatted.insert(dash, '-');
        }
    }
    formatted.truncate(SERIAL_LEN);
    formatted.into_iter().collect()
}
