use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid phone number '{0}': expected 10 digits with optional +1 prefix")]
pub struct PhoneParsingError(pub String);

/// North American phone number stored as its 10-digit national form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Accepts `XXXXXXXXXX`, `1XXXXXXXXXX`, `+XXXXXXXXXX` or `+1XXXXXXXXXX`.
    pub fn parse(raw: &str) -> Result<Self, PhoneParsingError> {
        let trimmed = raw.trim();
        let without_plus = trimmed.strip_prefix('+').unwrap_or(trimmed);

        if without_plus.is_empty() || !without_plus.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PhoneParsingError(raw.to_string()));
        }

        let digits = match without_plus.len() {
            10 => without_plus,
            11 if without_plus.starts_with('1') => &without_plus[1..],
            _ => return Err(PhoneParsingError(raw.to_string())),
        };

        Ok(Self(digits.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// E.164 form handed to the SMS provider.
    pub fn e164(&self) -> String {
        format!("+1{}", self.0)
    }
}

impl Display for PhoneNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = PhoneParsingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(phone: PhoneNumber) -> Self {
        phone.0
    }
}
