use serde::{Deserialize, Serialize};

use crate::error::{Result, ScienceError};

/// A checksum-verified ISBN, always available in its 13-digit form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Isbn {
    pub raw: String,
    pub isbn13: String,
    pub isbn10: Option<String>,
}

fn weighted_13(digits: &[u8]) -> u32 {
    digits
        .iter()
        .enumerate()
        .map(|(i, &d)| if i % 2 == 0 { d as u32 } else { d as u32 * 3 })
        .sum()
}

fn check_digit_13(first12: &[u8]) -> u8 {
    ((10 - weighted_13(first12) % 10) % 10) as u8
}

fn check_char_10(first9: &[u8]) -> char {
    let sum: u32 = first9
        .iter()
        .enumerate()
        .map(|(i, &d)| (10 - i as u32) * d as u32)
        .sum();
    match (11 - sum % 11) % 11 {
        10 => 'X',
        n => char::from(b'0' + n as u8),
    }
}

fn render(digits: &[u8]) -> String {
    digits.iter().map(|d| char::from(b'0' + d)).collect()
}

impl Isbn {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || ScienceError::InvalidIsbn(input.to_string());
        let compact: String = input
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();

        match compact.len() {
            13 => {
                let digits: Vec<u8> = compact
                    .chars()
                    .map(|c| c.to_digit(10).map(|d| d as u8))
                    .collect::<Option<_>>()
                    .ok_or_else(invalid)?;
                if weighted_13(&digits) % 10 != 0 {
                    return Err(invalid());
                }
                // Only the 978 prefix has a 10-digit form.
                let isbn10 = compact.starts_with("978").then(|| {
                    let mut s = render(&digits[3..12]);
                    s.push(check_char_10(&digits[3..12]));
                    s
                });
                Ok(Self {
                    raw: input.to_string(),
                    isbn13: compact,
                    isbn10,
                })
            }
            10 => {
                let mut digits = Vec::with_capacity(9);
                for c in compact.chars().take(9) {
                    digits.push(c.to_digit(10).ok_or_else(invalid)? as u8);
                }
                let last = compact.chars().last().ok_or_else(invalid)?;
                if check_char_10(&digits) != last {
                    return Err(invalid());
                }
                let mut d13 = vec![9, 7, 8];
                d13.extend_from_slice(&digits);
                d13.push(check_digit_13(&d13));
                Ok(Self {
                    raw: input.to_string(),
                    isbn13: render(&d13),
                    isbn10: Some(compact),
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Every valid ISBN of a `;`-separated field value.
    pub fn parse_all(field: &str) -> Vec<Self> {
        field
            .split(';')
            .filter_map(|part| Self::parse(part).ok())
            .collect()
    }

    /// `978-0-3064-0615-7`
    pub fn hyphenated(&self) -> String {
        let s = &self.isbn13;
        format!("{}-{}-{}-{}-{}", &s[0..3], &s[3..4], &s[4..8], &s[8..12], &s[12..13])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_isbn13() {
        let isbn = Isbn::parse("978-0-306-40615-7").unwrap();
        assert_eq!(isbn.isbn13, "9780306406157");
        assert_eq!(isbn.isbn10.as_deref(), Some("0306406152"));
        assert_eq!(isbn.hyphenated(), "978-0-3064-0615-7");
    }

    #[test]
    fn isbn10_converts_to_isbn13() {
        let isbn = Isbn::parse("0306406152").unwrap();
        assert_eq!(isbn.isbn13, "9780306406157");
        assert_eq!(Isbn::parse("007462542X").unwrap().isbn10.as_deref(), Some("007462542X"));
    }

    #[test]
    fn checksums_are_verified() {
        assert!(Isbn::parse("9780306406158").is_err());
        assert!(Isbn::parse("0306406153").is_err());
        assert!(Isbn::parse("12345").is_err());
    }

    #[test]
    fn isbn13_979_has_no_isbn10() {
        assert_eq!(Isbn::parse("9791032305690").unwrap().isbn10, None);
    }

    #[test]
    fn field_values_may_hold_several() {
        let all = Isbn::parse_all("0306406152; 9780306406158; 9791032305690");
        assert_eq!(all.len(), 2);
    }
}
