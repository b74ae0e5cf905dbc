//! Pluggable validation routines
//!
//! A constraint is a closure over a [`ValidationContext`] returning either a
//! violation list or a [`ConstraintFault`]. Panics raised by a constraint body
//! are caught and turned into recoverable faults; [`is_fatal`] decides which
//! faults abort the validation pass.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use super::context::ValidationContext;
use super::violation::{ValidationError, ViolationList};

/// Outcome of one constraint invocation
pub type ConstraintOutcome = Result<ViolationList, ConstraintFault>;

type ConstraintBody = dyn Fn(&ValidationContext<'_>) -> ConstraintOutcome + Send + Sync;

/// Classification of a constraint failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Ordinary failure inside the constraint body
    Recoverable,
    /// The constraint body panicked
    Panicked,
    /// Allocation failure
    OutOfMemory,
    /// Stack exhaustion
    StackOverflow,
    /// Any other condition the process cannot continue from
    Fatal,
}

/// A constraint failed instead of producing violations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("constraint failure ({kind:?}): {message}")]
pub struct ConstraintFault {
    /// Classification
    pub kind: FaultKind,
    /// Description
    pub message: String,
}

impl ConstraintFault {
    /// Fault of an explicit kind
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Ordinary failure
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Recoverable, message)
    }

    /// Unrecoverable failure
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Fatal, message)
    }
}

/// Whether a fault must propagate out of the validation pass
///
/// Recoverable faults and panics are contained and reported as validation
/// errors; resource exhaustion and explicit fatal faults are not.
pub fn is_fatal(fault: &ConstraintFault) -> bool {
    matches!(
        fault.kind,
        FaultKind::OutOfMemory | FaultKind::StackOverflow | FaultKind::Fatal
    )
}

/// A named validation routine
#[derive(Clone)]
pub struct Constraint {
    name: Arc<str>,
    body: Arc<ConstraintBody>,
}

impl Constraint {
    /// Constraint from a fallible body
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&ValidationContext<'_>) -> ConstraintOutcome + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            body: Arc::new(body),
        }
    }

    /// Constraint from a body that cannot fail
    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&ValidationContext<'_>) -> ViolationList + Send + Sync + 'static,
    {
        Self::new(name, move |context| Ok(body(context)))
    }

    /// Constraint that always reports the same violation
    pub fn add_validation_error(
        name: impl Into<String>,
        message: impl Into<String>,
        is_warning: bool,
        property_name: Option<String>,
    ) -> Self {
        let message = message.into();
        Self::from_fn(name, move |_| {
            vec![violation(&message, is_warning, property_name.as_deref())]
        })
    }

    /// Constraint that reports a violation whenever `assertion` is false
    pub fn assert_validation<P>(
        name: impl Into<String>,
        assertion: P,
        message: impl Into<String>,
        is_warning: bool,
        property_name: Option<String>,
    ) -> Self
    where
        P: Fn(&ValidationContext<'_>) -> bool + Send + Sync + 'static,
    {
        let message = message.into();
        Self::from_fn(name, move |context| {
            if assertion(context) {
                Vec::new()
            } else {
                vec![violation(&message, is_warning, property_name.as_deref())]
            }
        })
    }

    /// Constraint name, used in diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the body, converting a panic into a [`FaultKind::Panicked`] fault
    pub fn invoke(&self, context: &ValidationContext<'_>) -> ConstraintOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.body)(context))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(ConstraintFault::new(
                FaultKind::Panicked,
                panic_message(payload.as_ref()),
            )),
        }
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint").field("name", &self.name).finish()
    }
}

fn violation(message: &str, is_warning: bool, property_name: Option<&str>) -> ValidationError {
    let mut error = ValidationError::new(message);
    error.is_warning = is_warning;
    error.property_name = property_name.map(str::to_string);
    error
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "constraint panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classifier() {
        assert!(!is_fatal(&ConstraintFault::recoverable("bad input")));
        assert!(!is_fatal(&ConstraintFault::new(FaultKind::Panicked, "boom")));
        assert!(is_fatal(&ConstraintFault::new(FaultKind::OutOfMemory, "oom")));
        assert!(is_fatal(&ConstraintFault::new(FaultKind::StackOverflow, "deep")));
        assert!(is_fatal(&ConstraintFault::fatal("stop")));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "constraint panicked");
    }

    #[test]
    fn test_debug_shows_name_only() {
        let constraint = Constraint::add_validation_error("always", "nope", false, None);
        assert_eq!(format!("{constraint:?}"), "Constraint { name: \"always\" }");
        assert_eq!(constraint.name(), "always");
    }
}
