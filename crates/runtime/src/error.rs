//! Runtime errors
//!
//! Every fallible runtime operation reports a [`GreenletError`]. Switch
//! results carry either an owned payload or one of these errors, so an error
//! raised inside a greenlet reaches the greenlet that resumes next through
//! the same channel as an ordinary return value.

use sprig_core::{ApiResult, ErrorDescriptor, Object};
use std::fmt;

#[derive(Debug, Clone)]
pub enum GreenletError {
    /// Foreign-thread target, or a dead target with no live ancestor
    InvalidTarget(String),
    /// Operation not allowed in the greenlet's current lifecycle state
    InvalidState(String),
    /// Error raised in a greenlet (or thrown into it) and not caught
    Propagated(ErrorDescriptor),
    /// Stack or context allocation failed; the caller is unchanged
    Allocation(String),
}

impl GreenletError {
    /// True for a propagated exit request
    pub fn is_exit(&self) -> bool {
        matches!(self, GreenletError::Propagated(desc) if desc.is_exit())
    }

    /// The propagated descriptor, if this error carries one
    pub fn descriptor(&self) -> Option<&ErrorDescriptor> {
        match self {
            GreenletError::Propagated(desc) => Some(desc),
            _ => None,
        }
    }
}

impl fmt::Display for GreenletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GreenletError::InvalidTarget(msg) => write!(f, "invalid switch target: {}", msg),
            GreenletError::InvalidState(msg) => write!(f, "invalid greenlet state: {}", msg),
            GreenletError::Propagated(desc) => write!(f, "{}", desc),
            GreenletError::Allocation(msg) => write!(f, "greenlet allocation failed: {}", msg),
        }
    }
}

impl std::error::Error for GreenletError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GreenletError::Propagated(desc) => Some(desc),
            _ => None,
        }
    }
}

impl From<ErrorDescriptor> for GreenletError {
    fn from(desc: ErrorDescriptor) -> Self {
        GreenletError::Propagated(desc)
    }
}

/// What a switch delivers: an owned payload or an error
pub type SwitchResult = ApiResult<Object, GreenletError>;
