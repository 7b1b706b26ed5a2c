//! PII data types: the closed set of property types, their validators and maskers.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use piivault_core::{Error, Result};

/// Declared data type of a collection property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiType {
    Ssn,
    Email,
    PhoneNumber,
    ZipCodeUs,
    CcNumber,
    IpAddress,
    /// Free text.
    #[serde(rename = "STRING")]
    Text,
}

impl PiiType {
    pub fn all() -> &'static [PiiType] {
        &[
            Self::Ssn,
            Self::Email,
            Self::PhoneNumber,
            Self::ZipCodeUs,
            Self::CcNumber,
            Self::IpAddress,
            Self::Text,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            PiiType::Ssn => "SSN",
            PiiType::Email => "EMAIL",
            PiiType::PhoneNumber => "PHONE_NUMBER",
            PiiType::ZipCodeUs => "ZIP_CODE_US",
            PiiType::CcNumber => "CC_NUMBER",
            PiiType::IpAddress => "IP_ADDRESS",
            PiiType::Text => "STRING",
        }
    }

    /// Free text has no canonical form, so equality on it is not a sound uniqueness key.
    pub fn supports_unique(&self) -> bool {
        !matches!(self, PiiType::Text)
    }
}

impl fmt::Display for PiiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PiiType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PiiType::all()
            .iter()
            .copied()
            .find(|t| t.label() == s)
            .ok_or_else(|| Error::Validation(format!("unsupported data type: {}", s)))
    }
}

// Compiled regex patterns (compiled once, reused).
static SSN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]{3})-?([0-9]{2})-?([0-9]{4})$").unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9(][0-9\s().-]*[0-9]$").unwrap());
static ZIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{5}(-[0-9]{4})?$").unwrap());
static CC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9][0-9 -]*[0-9]$").unwrap());

const MAX_TEXT_LEN: usize = 4096;

/// A validated value, tagged with the data type it was validated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PiiValue {
    /// Stored as `NNN-NN-NNNN`.
    Ssn(String),
    /// Lowercased.
    Email(String),
    PhoneNumber(String),
    ZipCodeUs(String),
    /// Digits only.
    CcNumber(String),
    IpAddress(IpAddr),
    Text(String),
}

impl PiiValue {
    /// Validate `raw` against `pii_type`, producing its canonical form.
    pub fn parse(pii_type: PiiType, raw: &str) -> Result<Self> {
        let value = raw.trim();
        let invalid = || Error::Validation(format!("invalid {} value", pii_type.label()));

        match pii_type {
            PiiType::Ssn => {
                let caps = SSN_RE.captures(value).ok_or_else(invalid)?;
                Ok(Self::Ssn(format!("{}-{}-{}", &caps[1], &caps[2], &caps[3])))
            }
            PiiType::Email => {
                if !EMAIL_RE.is_match(value) {
                    return Err(invalid());
                }
                Ok(Self::Email(value.to_ascii_lowercase()))
            }
            PiiType::PhoneNumber => {
                let digits = value.chars().filter(char::is_ascii_digit).count();
                if !PHONE_RE.is_match(value) || !(7..=15).contains(&digits) {
                    return Err(invalid());
                }
                Ok(Self::PhoneNumber(value.to_string()))
            }
            PiiType::ZipCodeUs => {
                if !ZIP_RE.is_match(value) {
                    return Err(invalid());
                }
                Ok(Self::ZipCodeUs(value.to_string()))
            }
            PiiType::CcNumber => {
                if !CC_RE.is_match(value) {
                    return Err(invalid());
                }
                let digits: String = value.chars().filter(char::is_ascii_digit).collect();
                if !(13..=19).contains(&digits.len()) || !luhn_valid(&digits) {
                    return Err(invalid());
                }
                Ok(Self::CcNumber(digits))
            }
            PiiType::IpAddress => value.parse::<IpAddr>().map(Self::IpAddress).map_err(|_| invalid()),
            PiiType::Text => {
                if value.is_empty() || value.len() > MAX_TEXT_LEN {
                    return Err(invalid());
                }
                Ok(Self::Text(value.to_string()))
            }
        }
    }

    pub fn pii_type(&self) -> PiiType {
        match self {
            Self::Ssn(_) => PiiType::Ssn,
            Self::Email(_) => PiiType::Email,
            Self::PhoneNumber(_) => PiiType::PhoneNumber,
            Self::ZipCodeUs(_) => PiiType::ZipCodeUs,
            Self::CcNumber(_) => PiiType::CcNumber,
            Self::IpAddress(_) => PiiType::IpAddress,
            Self::Text(_) => PiiType::Text,
        }
    }

    /// Canonical string form; what gets encrypted and blind-indexed.
    pub fn canonical(&self) -> String {
        match self {
            Self::Ssn(v)
            | Self::Email(v)
            | Self::PhoneNumber(v)
            | Self::ZipCodeUs(v)
            | Self::CcNumber(v)
            | Self::Text(v) => v.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }

    /// Deterministic partial redaction.
    ///
    /// | type | visible portion |
    /// |---|---|
    /// | SSN | last four digits: `***-**-1234` |
    /// | EMAIL | domain: `****@somemail.com` |
    /// | PHONE_NUMBER | last four digits, punctuation kept |
    /// | ZIP_CODE_US | first three digits (ZIP3) |
    /// | CC_NUMBER | last four digits |
    /// | IP_ADDRESS | first octet / first IPv6 group |
    /// | STRING | nothing; one `*` per character |
    pub fn mask(&self) -> String {
        match self {
            Self::Ssn(v) => {
                let last: String = v.chars().skip(v.chars().count().saturating_sub(4)).collect();
                format!("***-**-{}", last)
            }
            Self::Email(v) => match v.split_once('@') {
                Some((local, domain)) => format!("{}@{}", "*".repeat(local.chars().count()), domain),
                None => "*".repeat(v.chars().count()),
            },
            Self::PhoneNumber(v) => mask_digits_keep_last(v, 4),
            Self::ZipCodeUs(v) => v
                .chars()
                .enumerate()
                .map(|(i, c)| if i < 3 || c == '-' { c } else { '*' })
                .collect(),
            Self::CcNumber(v) => mask_digits_keep_last(v, 4),
            Self::IpAddress(IpAddr::V4(ip)) => format!("{}.*.*.*", ip.octets()[0]),
            Self::IpAddress(IpAddr::V6(ip)) => format!("{:x}:*", ip.segments()[0]),
            Self::Text(v) => "*".repeat(v.chars().count()),
        }
    }
}

/// Replace every ASCII digit except the last `keep` with `*`.
fn mask_digits_keep_last(value: &str, keep: usize) -> String {
    let total = value.chars().filter(char::is_ascii_digit).count();
    let mut seen = 0;
    value
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                seen += 1;
                if seen + keep <= total {
                    return '*';
                }
            }
            c
        })
        .collect()
}

fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssn_mask_keeps_last_four() {
        let v = PiiValue::parse(PiiType::Ssn, "123-12-1234").unwrap();
        assert_eq!(v.mask(), "***-**-1234");
        let v = PiiValue::parse(PiiType::Ssn, "123121234").unwrap();
        assert_eq!(v.canonical(), "123-12-1234");
        assert_eq!(v.mask(), "***-**-1234");
    }

    #[test]
    fn test_mask_is_deterministic() {
        let v = PiiValue::parse(PiiType::Email, "john@somemail.com").unwrap();
        assert_eq!(v.mask(), v.mask());
        assert_eq!(v.mask(), "****@somemail.com");
        assert!(!v.mask().contains("john"));
    }

    #[test]
    fn test_phone_mask() {
        let v = PiiValue::parse(PiiType::PhoneNumber, "+1-121212123").unwrap();
        assert_eq!(v.mask(), "+*-*****2123");
        let v = PiiValue::parse(PiiType::PhoneNumber, "+1121212123").unwrap();
        assert_eq!(v.mask(), "+******2123");
    }

    #[test]
    fn test_zip_and_card_and_ip_masks() {
        assert_eq!(PiiValue::parse(PiiType::ZipCodeUs, "12345").unwrap().mask(), "123**");
        assert_eq!(
            PiiValue::parse(PiiType::ZipCodeUs, "12345-6789").unwrap().mask(),
            "123**-****"
        );
        let card = PiiValue::parse(PiiType::CcNumber, "4111 1111 1111 1111").unwrap();
        assert_eq!(card.canonical(), "4111111111111111");
        assert_eq!(card.mask(), "************1111");
        let ip = PiiValue::parse(PiiType::IpAddress, "192.168.1.100").unwrap();
        assert_eq!(ip.mask(), "192.*.*.*");
        assert_eq!(PiiValue::parse(PiiType::Text, "hello").unwrap().mask(), "*****");
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(PiiValue::parse(PiiType::Ssn, "12-3456-789").is_err());
        assert!(PiiValue::parse(PiiType::Email, "not-an-email").is_err());
        assert!(PiiValue::parse(PiiType::PhoneNumber, "12").is_err());
        assert!(PiiValue::parse(PiiType::ZipCodeUs, "1234").is_err());
        assert!(PiiValue::parse(PiiType::CcNumber, "4111111111111112").is_err());
        assert!(PiiValue::parse(PiiType::IpAddress, "300.1.1.1").is_err());
        assert!(PiiValue::parse(PiiType::Text, "   ").is_err());
    }

    #[test]
    fn test_rejects_non_ascii_digits() {
        assert!(PiiValue::parse(PiiType::Ssn, "१२३-१२-१२३४").is_err());
        assert!(PiiValue::parse(PiiType::Ssn, "١٢٣١٢١٢٣٤").is_err());
        assert!(PiiValue::parse(PiiType::ZipCodeUs, "١٢٣٤٥").is_err());
        assert!(PiiValue::parse(PiiType::ZipCodeUs, "12345-١٢٣٤").is_err());
    }

    #[test]
    fn test_email_canonical_is_lowercase() {
        let upper = PiiValue::parse(PiiType::Email, "John@SomeMail.com").unwrap();
        let lower = PiiValue::parse(PiiType::Email, "john@somemail.com").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.canonical(), "john@somemail.com");
    }

    #[test]
    fn test_type_labels_round_trip() {
        for t in PiiType::all() {
            assert_eq!(t.label().parse::<PiiType>().unwrap(), *t);
        }
        assert!("PASSPORT".parse::<PiiType>().is_err());
        assert_eq!(
            serde_json::to_string(&PiiType::ZipCodeUs).unwrap(),
            "\"ZIP_CODE_US\""
        );
        assert_eq!(serde_json::to_string(&PiiType::Text).unwrap(), "\"STRING\"");
    }

    #[test]
    fn test_unique_support() {
        assert!(PiiType::Ssn.supports_unique());
        assert!(!PiiType::Text.supports_unique());
    }
}
