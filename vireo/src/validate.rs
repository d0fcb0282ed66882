//! Bridges the `validator` derive onto the framework error taxonomy, plus
//! the phone-format rules commands register as a custom validator.

use std::borrow::Cow;

use validator::{Validate, ValidationError, ValidationErrors};

use crate::error::{Error, Result};

/// Run a value's declared constraints, aggregating failures into a single
/// human-readable message.
pub fn check<T: Validate>(value: &T) -> Result<()> {
    value
        .validate()
        .map_err(|errors| Error::Validation(flatten(&errors)))
}

fn flatten(errors: &ValidationErrors) -> String {
    let mut parts: Vec<String> = errors
        .field_errors()
        .iter()
        .map(|(field, failures)| {
            let codes: Vec<&str> = failures.iter().map(|f| f.code.as_ref()).collect();
            format!("{field}: {}", codes.join(", "))
        })
        .collect();
    parts.sort();
    parts.join("; ")
}

/// Accepted subscriber numbers: `0` then an operator digit (5/6/7/9) then
/// eight more digits.
pub fn is_valid_phone(phone: &str) -> bool {
    let bytes = phone.as_bytes();
    bytes.len() == 10
        && bytes[0] == b'0'
        && matches!(bytes[1], b'5' | b'6' | b'7' | b'9')
        && bytes[2..].iter().all(|b| b.is_ascii_digit())
}

/// Normalize a raw phone input: strip non-digits and rewrite the
/// international `2130…` prefix to the local `0…` form.
pub fn clean_phone(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::PhoneBadFormat);
    }
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let cleaned = match digits.strip_prefix("2130") {
        Some(rest) => format!("0{rest}"),
        None => digits,
    };
    if is_valid_phone(&cleaned) {
        Ok(cleaned)
    } else {
        Err(Error::PhoneBadFormat)
    }
}

/// Custom validator for `#[validate(custom = "vireo::validate::phone")]`.
pub fn phone(value: &str) -> Result<(), ValidationError> {
    if is_valid_phone(value) {
        Ok(())
    } else {
        let mut err = ValidationError::new("phone");
        err.message = Some(Cow::Borrowed("phone format not supported"));
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, Validate)]
    struct Signup {
        #[validate(length(min = 1))]
        user_id: String,
        #[validate(custom = "phone")]
        phone: String,
        #[validate(range(min = 4, max = 8))]
        pin_length: u32,
    }

    #[test]
    fn check_aggregates_field_failures() {
        let bad = Signup {
            user_id: String::new(),
            phone: "123".into(),
            pin_length: 2,
        };
        let err = check(&bad).unwrap_err();
        match err {
            Error::Validation(message) => {
                assert!(message.contains("user_id: length"), "{message}");
                assert!(message.contains("phone: phone"), "{message}");
                assert!(message.contains("pin_length: range"), "{message}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn check_passes_valid_values() {
        let good = Signup {
            user_id: "u1".into(),
            phone: "0550123456".into(),
            pin_length: 4,
        };
        assert!(check(&good).is_ok());
    }

    #[test]
    fn phone_pattern() {
        assert!(is_valid_phone("0550123456"));
        assert!(is_valid_phone("0990000000"));
        assert!(!is_valid_phone("0450123456"));
        assert!(!is_valid_phone("550123456"));
        assert!(!is_valid_phone("05501234567"));
        assert!(!is_valid_phone("05501234a6"));
    }

    #[test]
    fn clean_phone_normalizes() {
        assert_eq!(clean_phone("0550-123-456").unwrap(), "0550123456");
        assert_eq!(clean_phone("+213 0550123456").unwrap(), "0550123456");
        assert_eq!(clean_phone("2130550123456").unwrap(), "0550123456");
        assert_eq!(clean_phone("").unwrap_err(), Error::PhoneBadFormat);
        assert_eq!(clean_phone("12345").unwrap_err(), Error::PhoneBadFormat);
    }
}
