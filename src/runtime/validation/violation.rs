//! Validation findings and their aggregate

use std::fmt;

use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;

use super::report::{ExceptionReason, generate_exception_string};
use crate::runtime::activity::NodeIndex;
use crate::runtime::error::InvalidWorkflowError;

/// Publicly addressable activity an error is reported against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSource {
    /// Arena slot of the activity
    pub activity: NodeIndex,
    /// Display name at the time of attribution
    pub display_name: String,
}

impl ErrorSource {
    /// New source
    pub fn new(activity: NodeIndex, display_name: impl Into<String>) -> Self {
        Self {
            activity,
            display_name: display_name.into(),
        }
    }
}

/// One error or warning
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    /// Human readable description (prefixed when the offender is hidden)
    pub message: String,
    /// Warnings never fail validation
    pub is_warning: bool,
    /// Offending property or argument
    pub property_name: Option<String>,
    /// Activity the error is attributed to
    pub source: Option<ErrorSource>,
    /// Qualified id of `source`
    pub id: Option<String>,
    /// Extra data supplied by the reporter
    pub source_detail: Option<Value>,
}

/// Violations produced by one constraint
pub type ViolationList = Vec<ValidationError>;

impl ValidationError {
    /// Error with no attribution yet
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_warning: false,
            property_name: None,
            source: None,
            id: None,
            source_detail: None,
        }
    }

    /// Warning with no attribution yet
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            is_warning: true,
            ..Self::new(message)
        }
    }

    /// Set the offending property
    pub fn with_property(mut self, property_name: impl Into<String>) -> Self {
        self.property_name = Some(property_name.into());
        self
    }

    /// Attach reporter data
    pub fn with_source_detail(mut self, detail: Value) -> Self {
        self.source_detail = Some(detail);
        self
    }

    /// Attribute the error to an activity
    ///
    /// The first attribution wins; later calls leave the error untouched.
    pub fn attribute(&mut self, source: ErrorSource, id: Option<String>) {
        if self.source.is_none() {
            self.source = Some(source);
            self.id = id;
        }
    }

    /// Display name of the source, if attributed
    pub fn source_name(&self) -> Option<&str> {
        self.source.as_ref().map(|source| source.display_name.as_str())
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = if self.is_warning { "warning" } else { "error" };
        match (&self.id, self.source_name()) {
            (Some(id), Some(name)) => write!(f, "{level} [{id}] '{name}': {}", self.message),
            (None, Some(name)) => write!(f, "{level} '{name}': {}", self.message),
            _ => write!(f, "{level}: {}", self.message),
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    errors: Vec<ValidationError>,
    warnings: Vec<ValidationError>,
}

/// Ordered findings of one validation pass
#[derive(Debug, Default)]
pub struct ValidationResults {
    all: Vec<ValidationError>,
    partition: OnceCell<Partition>,
}

impl ValidationResults {
    /// Wrap an ordered list of findings
    pub fn new(all: Vec<ValidationError>) -> Self {
        Self {
            all,
            partition: OnceCell::new(),
        }
    }

    fn partition(&self) -> &Partition {
        self.partition.get_or_init(|| {
            let mut partition = Partition::default();
            for item in &self.all {
                if item.is_warning {
                    partition.warnings.push(item.clone());
                } else {
                    partition.errors.push(item.clone());
                }
            }
            partition
        })
    }

    /// Non-warning findings, in discovery order
    pub fn errors(&self) -> &[ValidationError] {
        &self.partition().errors
    }

    /// Warnings, in discovery order
    pub fn warnings(&self) -> &[ValidationError] {
        &self.partition().warnings
    }

    /// Every finding, in discovery order
    pub fn all(&self) -> &[ValidationError] {
        &self.all
    }

    /// Whether no error (warnings aside) was found
    pub fn is_valid(&self) -> bool {
        self.all.iter().all(|item| item.is_warning)
    }

    /// Fail with an aggregated [`InvalidWorkflowError`] if any error exists
    pub fn throw_if_violations_exist(&self) -> Result<(), InvalidWorkflowError> {
        match generate_exception_string(&self.all, ExceptionReason::ErrorsEncounteredWhileProcessingTree) {
            Some(message) => Err(InvalidWorkflowError::new(message)),
            None => Ok(()),
        }
    }
}
