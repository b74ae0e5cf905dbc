//! Constraint dispatch tests
//!
//! Exercises additional constraints end to end: lookup along the type
//! hierarchy, attribution of errors raised inside private implementations,
//! and containment of failing constraint bodies.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use weft::runtime::activity::{ActivityTree, NodeIndex};
use weft::runtime::definition::TreeDocument;
use weft::runtime::error::RuntimeError;
use weft::runtime::types::{TypeRegistry, builtin};
use weft::runtime::validation::{
    Constraint, ConstraintFault, FaultKind, ValidationError, ValidationSettings, validate_with_settings,
};

struct Nested {
    tree: ActivityTree,
    root: NodeIndex,
    public: NodeIndex,
    component: NodeIndex,
    hidden: NodeIndex,
}

// Root(Sequence) { Public(Sequence) }, with Hidden(Sequence) two implementation
// levels down: Root -> (impl) Component -> (impl) Hidden
fn nested_sequences() -> Nested {
    let mut builder = ActivityTree::builder(Arc::new(TypeRegistry::with_builtins()));
    let root = builder.activity(builtin::SEQUENCE, "Root").unwrap();
    let public = builder.activity(builtin::SEQUENCE, "Public").unwrap();
    let component = builder.activity(builtin::NATIVE_ACTIVITY, "Component").unwrap();
    let hidden = builder.activity(builtin::SEQUENCE, "Hidden").unwrap();
    builder.child(root, public).unwrap();
    builder.implementation_child(root, component).unwrap();
    builder.implementation_child(component, hidden).unwrap();
    Nested {
        tree: builder.build(root).unwrap(),
        root,
        public,
        component,
        hidden,
    }
}

fn always(message: &str) -> Constraint {
    Constraint::add_validation_error("always", message, false, None)
}

#[test]
fn test_constraint_on_sequence_hits_every_sequence() {
    let nested = nested_sequences();
    let mut settings = ValidationSettings::default();
    let sequence = nested.tree.types().key(builtin::SEQUENCE).unwrap();
    settings.add_constraint(sequence, always("bad"));

    let results = validate_with_settings(&nested.tree, &settings).unwrap();
    assert_eq!(results.errors().len(), 3);

    let find = |node: NodeIndex| -> Vec<&ValidationError> {
        results
            .errors()
            .iter()
            .filter(|error| error.source.as_ref().map(|source| source.activity) == Some(node))
            .collect()
    };

    let root_errors = find(nested.root);
    assert_eq!(root_errors.len(), 2);
    assert!(root_errors.iter().any(|error| error.message == "bad"));
    let hidden_error = root_errors
        .iter()
        .find(|error| error.message != "bad")
        .unwrap();
    assert!(
        hidden_error
            .message
            .starts_with("The private implementation of activity '1: Root' has the following validation error:")
    );
    assert!(hidden_error.message.ends_with("bad"));
    assert_eq!(hidden_error.id.as_deref(), Some("1"));

    let public_errors = find(nested.public);
    assert_eq!(public_errors.len(), 1);
    assert_eq!(public_errors[0].message, "bad");
    assert_eq!(public_errors[0].id.as_deref(), Some("2"));

    assert!(find(nested.hidden).is_empty());
}

#[test]
fn test_build_time_validation_attributes_to_boundary() {
    let nested = nested_sequences();
    let mut settings = ValidationSettings {
        skip_validating_root_configuration: true,
        ..Default::default()
    };
    let sequence = nested.tree.types().key(builtin::SEQUENCE).unwrap();
    settings.add_constraint(sequence, always("bad"));

    let results = validate_with_settings(&nested.tree, &settings).unwrap();
    assert_eq!(results.errors().len(), 3);
    let by = |node: NodeIndex| {
        results
            .errors()
            .iter()
            .filter(move |error| error.source.as_ref().map(|source| source.activity) == Some(node))
    };
    assert_eq!(by(nested.hidden).count(), 0);

    let boundary: Vec<&ValidationError> = by(nested.component).collect();
    assert_eq!(boundary.len(), 1);
    assert!(
        boundary[0]
            .message
            .starts_with("The private implementation of activity '1.1: Component' has the following validation error:")
    );
    assert!(boundary[0].message.ends_with("bad"));
    assert_eq!(boundary[0].id.as_deref(), Some("1.1"));
}

#[test]
fn test_base_and_open_generic_dispatch() {
    let text = r#"{
        "root": "Main",
        "types": [{ "name": "Approval", "base": "Sequence" }],
        "activities": [
            { "name": "Main", "type": "Approval", "children": ["Hello"] },
            { "name": "Hello", "type": "WriteLine", "behavior": { "kind": "write_line" },
              "arguments": [{ "name": "Text", "direction": "In", "value_type": "string" }],
              "bindings": { "Text": "Greeting" } },
            { "name": "Greeting", "type": "Literal<String>",
              "behavior": { "kind": "expression", "value": "hello" } }
        ]
    }"#;
    let tree = TreeDocument::from_json(text)
        .unwrap()
        .into_tree(&TypeRegistry::with_builtins())
        .unwrap();
    let types = tree.types().clone();

    let mut settings = ValidationSettings::default();
    settings.add_constraint(types.key(builtin::SEQUENCE).unwrap(), always("sequence"));
    settings.add_constraint(types.key("Literal<>").unwrap(), always("any literal"));
    settings.add_constraint(types.key("CodeActivity<>").unwrap(), always("any code activity"));
    settings.add_constraint(types.key(builtin::ACTIVITY).unwrap(), Constraint::from_fn("count", |_| Vec::new()));

    let results = validate_with_settings(&tree, &settings).unwrap();
    let messages: Vec<(&str, &str)> = results
        .errors()
        .iter()
        .map(|error| (error.source_name().unwrap(), error.message.as_str()))
        .collect();

    assert!(messages.contains(&("Main", "sequence")));
    assert!(messages.contains(&("Greeting", "any literal")));
    assert!(messages.contains(&("Greeting", "any code activity")));
    assert!(!messages.iter().any(|(source, _)| *source == "Hello"));
    assert_eq!(messages.len(), 3);
}

#[test]
fn test_panicking_constraint_is_contained() {
    let nested = nested_sequences();
    let mut settings = ValidationSettings::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    settings.add_constraint(
        nested.tree.types().root(),
        Constraint::from_fn("explodes", |context| {
            if context.to_validate().display_name() == "Public" {
                panic!("boom");
            }
            Vec::new()
        }),
    );
    settings.add_constraint(
        nested.tree.types().root(),
        Constraint::from_fn("counts", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }),
    );

    let results = validate_with_settings(&nested.tree, &settings).unwrap();
    assert_eq!(results.errors().len(), 1);
    let error = &results.errors()[0];
    assert!(error.message.contains("An internal constraint failure occurred"));
    assert!(error.message.contains("explodes"));
    assert!(error.message.contains("boom"));
    assert_eq!(error.source_name(), Some("Public"));

    // the failing body does not stop later constraints or nodes
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_recoverable_fault_is_reported() {
    let nested = nested_sequences();
    let mut settings = ValidationSettings::default();
    settings.add_constraint(
        nested.tree.types().root(),
        Constraint::new("flaky", |context| {
            if context.to_validate().display_name() == "Root" {
                Err(ConstraintFault::recoverable("lookup failed"))
            } else {
                Ok(Vec::new())
            }
        }),
    );

    let results = validate_with_settings(&nested.tree, &settings).unwrap();
    assert_eq!(results.errors().len(), 1);
    assert!(results.errors()[0].message.contains("lookup failed"));
}

#[test]
fn test_fatal_fault_aborts_validation() {
    let nested = nested_sequences();
    let mut settings = ValidationSettings::default();
    settings.add_constraint(
        nested.tree.types().root(),
        Constraint::new("exhausted", |_| Err(ConstraintFault::new(FaultKind::OutOfMemory, "no memory"))),
    );

    match validate_with_settings(&nested.tree, &settings) {
        Err(RuntimeError::FatalConstraint(fault)) => {
            assert_eq!(fault.kind, FaultKind::OutOfMemory);
            assert_eq!(fault.message, "no memory");
        }
        other => panic!("expected a fatal constraint fault, got {other:?}"),
    }
}

#[test]
fn test_only_additional_constraints_hides_structural_errors() {
    let text = r#"{
        "root": "Main",
        "activities": [
            { "name": "Main", "type": "Sequence", "children": ["Hello"] },
            { "name": "Hello", "type": "WriteLine", "behavior": { "kind": "write_line" },
              "arguments": [{ "name": "Text", "direction": "In", "value_type": "string", "is_required": true }] }
        ]
    }"#;
    let tree = TreeDocument::from_json(text)
        .unwrap()
        .into_tree(&TypeRegistry::with_builtins())
        .unwrap();

    let plain = validate_with_settings(&tree, &ValidationSettings::default()).unwrap();
    assert_eq!(plain.errors().len(), 1);
    assert!(plain.errors()[0].message.contains("'Text' was not supplied"));

    let mut settings = ValidationSettings {
        only_use_additional_constraints: true,
        ..Default::default()
    };
    settings.add_constraint(tree.types().key(builtin::WRITE_LINE).unwrap(), always("write line"));
    let results = validate_with_settings(&tree, &settings).unwrap();
    assert_eq!(results.errors().len(), 1);
    assert_eq!(results.errors()[0].message, "write line");
}

#[test]
fn test_context_parents_and_children() {
    let nested = nested_sequences();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let record = seen.clone();
    let mut settings = ValidationSettings::default();
    settings.add_constraint(
        nested.tree.types().key(builtin::SEQUENCE).unwrap(),
        Constraint::from_fn("shape", move |context| {
            let name = context.to_validate().display_name().to_string();
            let parents: Vec<String> = context
                .get_parents()
                .iter()
                .map(|parent| parent.display_name().to_string())
                .collect();
            let children: Vec<String> = context
                .get_children()
                .iter()
                .map(|child| child.display_name().to_string())
                .collect();
            record.lock().push((name, parents, children));
            Vec::new()
        }),
    );

    let results = validate_with_settings(&nested.tree, &settings).unwrap();
    assert!(results.is_valid());

    let seen = seen.lock();
    let root = seen.iter().find(|(name, _, _)| name == "Root").unwrap();
    assert!(root.1.is_empty());
    assert_eq!(root.2, vec!["Public".to_string(), "Component".to_string(), "Hidden".to_string()]);

    let public = seen.iter().find(|(name, _, _)| name == "Public").unwrap();
    assert_eq!(public.1, vec!["Root".to_string()]);
    assert!(public.2.is_empty());

    let hidden = seen.iter().find(|(name, _, _)| name == "Hidden").unwrap();
    assert_eq!(hidden.1, vec!["Component".to_string(), "Root".to_string()]);
}
