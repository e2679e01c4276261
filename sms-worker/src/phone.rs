//! E.164 phone number normalization.

use std::sync::LazyLock;

use regex::Regex;

static EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(?:ext\.?|x|#)\s*\d+\s*$").unwrap());

/// Shortest and longest accepted numbers, counting the leading `+`.
const MIN_LEN: usize = 8;
const MAX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,
    #[error("phone number contains invalid character '{0}'")]
    InvalidCharacter(char),
    #[error("phone number is too short")]
    TooShort,
    #[error("phone number is too long")]
    TooLong,
}

/// Normalize a user-supplied phone number to `+<digits>`.
///
/// Formatting characters (spaces, dashes, dots, parentheses, slashes) and a
/// trailing extension are dropped. A leading `00` international prefix becomes
/// `+`. A number without a country prefix is taken as already international.
pub fn normalize(raw: &str) -> Result<String, PhoneError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PhoneError::Empty);
    }

    let without_ext = EXTENSION.replace(trimmed, "");
    let without_ext = without_ext.trim();

    let mut digits = String::with_capacity(without_ext.len());
    for (i, c) in without_ext.chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            '+' if i == 0 => {}
            ' ' | '-' | '.' | '(' | ')' | '/' => {}
            other => return Err(PhoneError::InvalidCharacter(other)),
        }
    }

    if digits.is_empty() {
        return Err(PhoneError::Empty);
    }

    let digits = if !without_ext.starts_with('+') {
        digits.strip_prefix("00").unwrap_or(&digits).to_string()
    } else {
        digits
    };

    let normalized = format!("+{digits}");
    if normalized.len() < MIN_LEN {
        return Err(PhoneError::TooShort);
    }
    if normalized.len() > MAX_LEN {
        return Err(PhoneError::TooLong);
    }
    Ok(normalized)
}
