//! Failure taxonomy delivered through a sink's failure channel.
//!
//! A [`Cause`] is one of three things:
//! - `Fail(E)`: an expected, application-defined error value
//! - `Die(Defect)`: an unexpected fault, e.g. a panicking sink
//! - `Interrupt`: the work was cancelled, not an application error

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An unexpected, unrecoverable fault.
///
/// Defects are cheap to clone so the same fault can be fanned out to every
/// subscriber of a multicast source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("defect: {message}")]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    /// Build a defect from a panic payload captured by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(message)
    }

    /// The defect's description.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a stream stopped delivering values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// Expected, typed failure.
    Fail(E),
    /// Unexpected fault.
    Die(Defect),
    /// Cancellation.
    Interrupt,
}

impl<E> Cause<E> {
    /// Typed failure.
    pub fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// Defect with the given description.
    pub fn die(message: impl Into<String>) -> Self {
        Self::Die(Defect::new(message))
    }

    /// Cancellation.
    pub fn interrupt() -> Self {
        Self::Interrupt
    }

    /// Whether this is a typed failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    /// Whether this is a defect.
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::Die(_))
    }

    /// Whether this is a cancellation.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt)
    }

    /// The typed failure, if this cause carries one.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Self::Fail(error) => Some(error),
            _ => None,
        }
    }

    /// Convert the typed failure, leaving defects and interruptions untouched.
    pub fn map<E2>(self, f: impl FnOnce(E) -> E2) -> Cause<E2> {
        match self {
            Self::Fail(error) => Cause::Fail(f(error)),
            Self::Die(defect) => Cause::Die(defect),
            Self::Interrupt => Cause::Interrupt,
        }
    }
}

impl<E> From<Defect> for Cause<E> {
    fn from(defect: Defect) -> Self {
        Self::Die(defect)
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail(error) => write!(f, "failure: {error}"),
            Self::Die(defect) => write!(f, "{defect}"),
            Self::Interrupt => write!(f, "interrupted"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Cause<E> {}

/// Outcome of a single emission or pull.
pub type Exit<A, E> = Result<A, Cause<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defect_from_str_panic() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(Defect::from_panic(payload).message(), "boom");
    }

    #[test]
    fn test_defect_from_formatted_panic() {
        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(Defect::from_panic(payload).message(), "code 7");
    }

    #[test]
    fn test_cause_map_keeps_defects() {
        let cause: Cause<u8> = Cause::die("bad");
        let mapped = cause.map(|e| e.to_string());
        assert!(mapped.is_defect());

        let failed: Cause<u8> = Cause::fail(3);
        assert_eq!(failed.map(u16::from), Cause::Fail(3u16));
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(Cause::<String>::interrupt().to_string(), "interrupted");
        assert_eq!(Cause::fail("nope").to_string(), "failure: nope");
    }
}
