//! Exception text aggregation and root input validation

use std::collections::BTreeMap;

use serde_json::Value;

use super::violation::{ErrorSource, ValidationError};
use crate::runtime::activity::ActivityTree;
use crate::runtime::error::ArgumentError;
use crate::runtime::metadata::argument_violations;

/// Maximum length, in characters, of an aggregated exception message
pub const EXCEPTION_STRING_MAX_LENGTH: usize = 4096;

const UNKNOWN_ACTIVITY: &str = "<UnknownActivity>";
const TOO_MANY_VIOLATIONS: &str =
    "\nThe workflow has too many validation errors to display them all; the list above is truncated.";

/// Why an exception string is being generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionReason {
    /// Structural or constraint validation of a tree
    ErrorsEncounteredWhileProcessingTree,
    /// Root inputs were supplied but do not satisfy the root's arguments
    RootArgumentViolationsFound,
    /// No root inputs were supplied and the root's arguments need some
    RootArgumentViolationsFoundNoInputs,
}

impl ExceptionReason {
    fn preamble(self) -> &'static str {
        match self {
            ExceptionReason::ErrorsEncounteredWhileProcessingTree => {
                "The following errors were encountered while processing the workflow tree:"
            }
            ExceptionReason::RootArgumentViolationsFound => {
                "The root activity's argument settings are incorrect. \
                 Either fix the workflow definition or supply input values to fix these errors:"
            }
            ExceptionReason::RootArgumentViolationsFoundNoInputs => {
                "The root activity's argument settings are incorrect. \
                 Update the workflow definition to fix these errors:"
            }
        }
    }
}

/// Render the non-warning entries of `errors` as one bounded message
///
/// Returns `None` when there is no error to report.
pub fn generate_exception_string(errors: &[ValidationError], reason: ExceptionReason) -> Option<String> {
    let mut text: Option<String> = None;
    let mut length = 0;
    let mut exceeded = false;

    for error in errors.iter().filter(|error| !error.is_warning) {
        let text = text.get_or_insert_with(|| {
            let preamble = reason.preamble();
            length = preamble.chars().count();
            preamble.to_string()
        });

        let line = format!(
            "\n'{}': {}",
            error.source_name().unwrap_or(UNKNOWN_ACTIVITY),
            error.message
        );
        length += line.chars().count();
        text.push_str(&line);

        if length > EXCEPTION_STRING_MAX_LENGTH {
            exceeded = true;
            break;
        }
    }

    let mut text = text?;
    if exceeded {
        let keep = EXCEPTION_STRING_MAX_LENGTH - TOO_MANY_VIOLATIONS.chars().count();
        if let Some((cut, _)) = text.char_indices().nth(keep) {
            text.truncate(cut);
        }
        text.push_str(TOO_MANY_VIOLATIONS);
    }
    Some(text)
}

/// Check root input values against the root activity's arguments
///
/// Required and overload-group rules apply to the root's input arguments;
/// with an input map, unknown keys and values of the wrong type are
/// reported as well. Fails with parameter `"program"` when `inputs` is
/// `None`, `"rootArgumentValues"` otherwise.
pub fn validate_root_inputs(
    tree: &ActivityTree,
    inputs: Option<&BTreeMap<String, Value>>,
) -> Result<(), ArgumentError> {
    let root = tree.get(tree.root());
    let node = root.node();
    let attribute = |mut error: ValidationError| {
        error.attribute(ErrorSource::new(root.index(), root.display_name()), Some("1".to_string()));
        error
    };

    let supplied = |name: &str| inputs.is_some_and(|inputs| inputs.contains_key(name));
    let mut errors: Vec<ValidationError> = argument_violations(node, |arg| {
        !arg.direction.is_input() || arg.is_bound() || supplied(&arg.name)
    })
    .into_iter()
    .map(|(message, property)| {
        let mut error = ValidationError::new(message);
        error.property_name = property;
        attribute(error)
    })
    .collect();

    if let Some(inputs) = inputs {
        let unused: Vec<&str> = inputs
            .keys()
            .filter(|key| {
                !node
                    .arguments
                    .iter()
                    .any(|arg| arg.direction.is_input() && &arg.name == *key)
            })
            .map(String::as_str)
            .collect();
        if !unused.is_empty() {
            errors.push(attribute(ValidationError::new(format!(
                "The following keys from the input dictionary do not map to arguments and must be removed: {}. \
                 Argument names are case sensitive.",
                unused.join(", ")
            ))));
        }

        for arg in node.arguments.iter().filter(|arg| arg.direction.is_input()) {
            if let Some(value) = inputs.get(&arg.name) {
                if !arg.value_type.is_compatible(value) {
                    errors.push(attribute(
                        ValidationError::new(format!(
                            "Expected an input value of type '{}' for argument '{}'.",
                            arg.value_type, arg.name
                        ))
                        .with_property(arg.name.clone()),
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        return Ok(());
    }

    let (param, reason) = match inputs {
        None => ("program", ExceptionReason::RootArgumentViolationsFoundNoInputs),
        Some(_) => ("rootArgumentValues", ExceptionReason::RootArgumentViolationsFound),
    };
    let message = generate_exception_string(&errors, reason).unwrap_or_default();
    Err(ArgumentError::new(param, message))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::runtime::activity::{ActivityNode, RuntimeArgument, ValueType};
    use crate::runtime::types::{TypeRegistry, builtin};

    fn error(message: &str) -> ValidationError {
        let mut error = ValidationError::new(message);
        error.attribute(ErrorSource::new(crate::runtime::activity::NodeIndex(0), "Root"), None);
        error
    }

    #[test]
    fn test_no_errors_no_string() {
        let warnings = vec![ValidationError::warning("only a warning")];
        assert!(generate_exception_string(&warnings, ExceptionReason::ErrorsEncounteredWhileProcessingTree).is_none());
        assert!(generate_exception_string(&[], ExceptionReason::ErrorsEncounteredWhileProcessingTree).is_none());
    }

    #[test]
    fn test_lines_and_placeholder() {
        let errors = vec![error("bad"), ValidationError::new("orphan")];
        let text = generate_exception_string(&errors, ExceptionReason::ErrorsEncounteredWhileProcessingTree).unwrap();
        assert!(text.starts_with("The following errors"));
        assert!(text.contains("\n'Root': bad"));
        assert!(text.contains("\n'<UnknownActivity>': orphan"));
    }

    #[test]
    fn test_truncation_counts_characters() {
        let errors: Vec<_> = (0..400).map(|i| error(&format!("ünïcödé violation number {i}"))).collect();
        let text = generate_exception_string(&errors, ExceptionReason::ErrorsEncounteredWhileProcessingTree).unwrap();
        assert_eq!(text.chars().count(), EXCEPTION_STRING_MAX_LENGTH);
        assert!(text.ends_with(TOO_MANY_VIOLATIONS));
    }

    fn root_with_arguments() -> ActivityTree {
        let types = Arc::new(TypeRegistry::with_builtins());
        let mut builder = ActivityTree::builder(types.clone());
        let root = builder.add(
            ActivityNode::new("Root", types.key(builtin::SEQUENCE).unwrap())
                .with_argument(RuntimeArgument::input("Name", ValueType::String).required())
                .with_argument(RuntimeArgument::input("Count", ValueType::Int))
                .with_argument(RuntimeArgument::output("Result", ValueType::String).required()),
        );
        builder.build(root).unwrap()
    }

    #[test]
    fn test_root_inputs_missing_program() {
        let tree = root_with_arguments();
        let err = validate_root_inputs(&tree, None).unwrap_err();
        assert_eq!(err.param, "program");
        assert!(err.message.contains("'Name'"));
        assert!(!err.message.contains("'Result'"));
    }

    #[test]
    fn test_root_inputs_unknown_and_mistyped() {
        let tree = root_with_arguments();
        let inputs: BTreeMap<String, Value> = [
            ("Name".to_string(), json!("weft")),
            ("Count".to_string(), json!("three")),
            ("Extra".to_string(), json!(1)),
            ("Other".to_string(), json!(2)),
        ]
        .into_iter()
        .collect();
        let err = validate_root_inputs(&tree, Some(&inputs)).unwrap_err();
        assert_eq!(err.param, "rootArgumentValues");
        assert!(err.message.contains("Extra, Other"));
        assert!(err.message.contains("argument 'Count'"));
    }

    #[test]
    fn test_root_inputs_ok() {
        let tree = root_with_arguments();
        let inputs: BTreeMap<String, Value> = [("Name".to_string(), json!("weft")), ("Count".to_string(), json!(3))]
            .into_iter()
            .collect();
        assert!(validate_root_inputs(&tree, Some(&inputs)).is_ok());
    }
}
