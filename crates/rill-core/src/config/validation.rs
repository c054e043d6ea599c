//! Configuration validation utilities and rules

use crate::RillError;
use std::fmt;

/// Configuration validation result
pub type ValidationResult = Result<(), ValidationError>;

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Value is out of acceptable range
    OutOfRange {
        field: String,
        min: Option<u64>,
        max: Option<u64>,
        actual: u64,
    },
    /// Custom validation failed
    Custom { field: String, message: String },
    /// Several rules failed at once
    Multiple(Vec<ValidationError>),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::OutOfRange {
                field,
                min,
                max,
                actual,
            } => {
                let range_desc = match (min, max) {
                    (Some(min), Some(max)) => format!("between {min} and {max}"),
                    (Some(min), None) => format!("at least {min}"),
                    (None, Some(max)) => format!("at most {max}"),
                    (None, None) => "in valid range".to_string(),
                };
                write!(f, "Field '{field}' must be {range_desc} (got {actual})")
            }
            ValidationError::Custom { field, message } => {
                write!(f, "Field '{field}': {message}")
            }
            ValidationError::Multiple(errors) => {
                let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
                write!(f, "{}", joined.join("; "))
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for RillError {
    fn from(err: ValidationError) -> Self {
        RillError::config(err.to_string())
    }
}

/// Configuration validator that accumulates validation rules
#[derive(Debug, Default)]
pub struct ConfigValidator {
    errors: Vec<ValidationError>,
}

impl ConfigValidator {
    /// Create a new validator
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate that a number is within range
    pub fn range(
        &mut self,
        field: &str,
        value: u64,
        min: Option<u64>,
        max: Option<u64>,
    ) -> &mut Self {
        let below = min.is_some_and(|min| value < min);
        let above = max.is_some_and(|max| value > max);
        if below || above {
            self.errors.push(ValidationError::OutOfRange {
                field: field.to_string(),
                min,
                max,
                actual: value,
            });
        }
        self
    }

    /// Add a custom rule
    pub fn check(&mut self, field: &str, ok: bool, message: &str) -> &mut Self {
        if !ok {
            self.errors.push(ValidationError::Custom {
                field: field.to_string(),
                message: message.to_string(),
            });
        }
        self
    }

    /// Finish validation
    pub fn finish(&mut self) -> ValidationResult {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(ValidationError::Multiple(std::mem::take(&mut self.errors))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_accumulates() {
        let mut validator = ConfigValidator::new();
        validator
            .range("a", 5, Some(1), Some(10))
            .range("b", 0, Some(1), None)
            .range("c", 11, None, Some(10));

        match validator.finish() {
            Err(ValidationError::Multiple(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_message() {
        let err = ValidationError::OutOfRange {
            field: "keyed_debounce_ms".into(),
            min: None,
            max: Some(10),
            actual: 20,
        };
        assert_eq!(
            err.to_string(),
            "Field 'keyed_debounce_ms' must be at most 10 (got 20)"
        );
    }
}
