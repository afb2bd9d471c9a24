//! Error descriptors
//!
//! An [`ErrorDescriptor`] is what travels when a greenlet raises, is thrown
//! into, or dies with an error: a kind, a message and an optional attached
//! host value. The special exit kind asks a greenlet to terminate and counts
//! as normal completion when it propagates out of the greenlet's body.

use crate::object::Object;
use crate::refs::Owned;
use std::fmt;

/// Kind name of the exit error
pub const EXIT: &str = "GreenletExit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request to terminate; swallowed at the greenlet boundary
    Exit,
    /// A Rust panic escaped a greenlet body
    Panic,
    /// Anything raised by user code, identified by name
    Raised(String),
}

impl ErrorKind {
    pub fn name(&self) -> &str {
        match self {
            ErrorKind::Exit => EXIT,
            ErrorKind::Panic => "Panic",
            ErrorKind::Raised(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
    pub value: Option<Owned<Object>>,
}

impl ErrorDescriptor {
    /// Build an error of the given kind. The name "GreenletExit" maps to the
    /// exit kind so that hosts raising it by name get exit semantics.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let kind = if kind == EXIT {
            ErrorKind::Exit
        } else {
            ErrorKind::Raised(kind)
        };
        ErrorDescriptor {
            kind,
            message: message.into(),
            value: None,
        }
    }

    pub fn exit() -> Self {
        ErrorDescriptor {
            kind: ErrorKind::Exit,
            message: String::new(),
            value: None,
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        ErrorDescriptor {
            kind: ErrorKind::Panic,
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: Owned<Object>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn is_exit(&self) -> bool {
        self.kind == ErrorKind::Exit
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.message)
        }
    }
}

impl std::error::Error for ErrorDescriptor {}

/// Format a panic payload into an error message
pub fn format_panic_payload(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::RefCounted;

    #[test]
    fn test_exit_by_name() {
        let err = ErrorDescriptor::new("GreenletExit", "");
        assert!(err.is_exit());
        assert_eq!(err.to_string(), "GreenletExit");
    }

    #[test]
    fn test_raised_display() {
        let err = ErrorDescriptor::new("ValueError", "bad input");
        assert!(!err.is_exit());
        assert_eq!(err.kind, ErrorKind::Raised("ValueError".to_string()));
        assert_eq!(err.to_string(), "ValueError: bad input");
    }

    #[test]
    fn test_attached_value_is_owned() {
        let obj = Object::int(9);
        let err = ErrorDescriptor::new("E", "m").with_value(obj.clone());
        assert_eq!(obj.refcount(), 2);
        drop(err);
        assert_eq!(obj.refcount(), 1);
    }

    #[test]
    fn test_format_panic_payload() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(format_panic_payload(payload.as_ref()), "boom 1");

        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(format_panic_payload(payload.as_ref()), "static");
    }
}
