//! JSON workflow definitions
//!
//! A [`TreeDocument`] lists activities flat and links them by name, so
//! shared subtrees and back-references can be written down directly.
//!
//! ```json
//! {
//!   "root": "Main",
//!   "activities": [
//!     { "name": "Main", "type": "Sequence", "children": ["Hello"] },
//!     { "name": "Hello", "type": "WriteLine", "behavior": { "kind": "write_line" },
//!       "arguments": [{ "name": "Text", "direction": "In", "value_type": "string" }],
//!       "bindings": { "Text": "Greeting" } },
//!     { "name": "Greeting", "type": "Literal<String>",
//!       "behavior": { "kind": "expression", "value": "hello" } }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::activity::{ActivityKind, ActivityNode, ActivityTree, NodeIndex, RuntimeArgument};
use super::error::ArgumentError;
use super::types::{TypeKey, TypeRegistry};

/// A type registered by the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDeclaration {
    /// Type name
    pub name: String,
    /// Base type name
    #[serde(default = "default_base")]
    pub base: String,
}

fn default_base() -> String {
    super::types::builtin::NATIVE_ACTIVITY.to_string()
}

/// One activity of the document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDocument {
    /// Unique name, used for references; doubles as the display name
    pub name: String,
    /// Activity type; closed generics are written `Literal<String>`
    #[serde(rename = "type")]
    pub type_name: String,
    /// Display name, when different from `name`
    #[serde(default)]
    pub display_name: Option<String>,
    /// Runtime behaviour
    #[serde(default = "default_behavior")]
    pub behavior: ActivityKind,
    /// Declared arguments
    #[serde(default)]
    pub arguments: Vec<RuntimeArgument>,
    /// Argument name to expression activity name
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    /// Public children
    #[serde(default)]
    pub children: Vec<String>,
    /// Implementation children
    #[serde(default)]
    pub implementation: Vec<String>,
    /// Imported (non-owning) children
    #[serde(default)]
    pub imports: Vec<String>,
    /// Whether the activity can leave the instance idle
    #[serde(default)]
    pub can_induce_idle: bool,
}

fn default_behavior() -> ActivityKind {
    ActivityKind::Composite
}

/// Serialized workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDocument {
    /// Name of the root activity
    pub root: String,
    /// Extra types used by the activities
    #[serde(default)]
    pub types: Vec<TypeDeclaration>,
    /// Every activity, in any order
    pub activities: Vec<ActivityDocument>,
}

impl TreeDocument {
    /// Parse a document from JSON text
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Read a document from a file
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read definition: {:?}", path))?;
        Self::from_json(&text).with_context(|| format!("Failed to parse definition: {:?}", path))
    }

    /// Build the activity tree over a copy of `types`
    pub fn into_tree(self, types: &TypeRegistry) -> Result<ActivityTree, ArgumentError> {
        let mut types = types.clone();
        for declaration in &self.types {
            let base = resolve_type(&mut types, &declaration.base)?;
            types.register(&declaration.name, base)?;
        }

        let mut keys = Vec::with_capacity(self.activities.len());
        for activity in &self.activities {
            keys.push(resolve_type(&mut types, &activity.type_name)?);
        }

        let mut builder = ActivityTree::builder(Arc::new(types));
        let mut by_name: HashMap<String, NodeIndex> = HashMap::new();
        for (activity, key) in self.activities.iter().zip(keys) {
            let mut node = ActivityNode::new(
                activity.display_name.clone().unwrap_or_else(|| activity.name.clone()),
                key,
            )
            .with_kind(activity.behavior.clone());
            node.arguments = activity.arguments.clone();
            if activity.can_induce_idle {
                node = node.inducing_idle();
            }
            let index = builder.add(node);
            if by_name.insert(activity.name.clone(), index).is_some() {
                return Err(ArgumentError::new(
                    "activities",
                    format!("activity name '{}' is used more than once", activity.name),
                ));
            }
        }

        let lookup = |name: &str| {
            by_name
                .get(name)
                .copied()
                .ok_or_else(|| ArgumentError::new("activities", format!("unknown activity '{name}'")))
        };
        for activity in &self.activities {
            let parent = lookup(&activity.name)?;
            for child in &activity.children {
                builder.child(parent, lookup(child)?)?;
            }
            for child in &activity.implementation {
                builder.implementation_child(parent, lookup(child)?)?;
            }
            for child in &activity.imports {
                builder.import(parent, lookup(child)?)?;
            }
            for (argument, expression) in &activity.bindings {
                builder.bind(parent, argument, lookup(expression)?)?;
            }
        }
        builder.build(lookup(&self.root)?)
    }
}

/// Resolve a type name, instantiating `Name<Args>` against `Name<>` on demand
fn resolve_type(types: &mut TypeRegistry, name: &str) -> Result<TypeKey, ArgumentError> {
    if let Some(key) = types.key(name) {
        return Ok(key);
    }
    let unknown = || ArgumentError::new("type", format!("unknown activity type '{name}'"));
    let (stem, rest) = name.split_once('<').ok_or_else(unknown)?;
    let arguments = rest.strip_suffix('>').ok_or_else(unknown)?;
    let definition = types.key(&format!("{stem}<>")).ok_or_else(unknown)?;
    let arguments: Vec<&str> = arguments.split(',').map(str::trim).filter(|arg| !arg.is_empty()).collect();
    types.instantiate(definition, &arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::builtin;

    const HELLO: &str = r#"{
        "root": "Main",
        "types": [{ "name": "Approval", "base": "Sequence" }],
        "activities": [
            { "name": "Main", "type": "Approval", "children": ["Hello", "Wait"], "imports": ["Hello"] },
            { "name": "Hello", "type": "WriteLine", "behavior": { "kind": "write_line" },
              "arguments": [{ "name": "Text", "direction": "In", "value_type": "string", "is_required": true }],
              "bindings": { "Text": "Greeting" } },
            { "name": "Greeting", "type": "Literal<String>",
              "behavior": { "kind": "expression", "value": "hello" } },
            { "name": "Wait", "type": "WaitForBookmark",
              "behavior": { "kind": "wait_for_bookmark", "bookmark": "go" } }
        ]
    }"#;

    #[test]
    fn test_document_into_tree() {
        let document = TreeDocument::from_json(HELLO).unwrap();
        let tree = document.into_tree(&TypeRegistry::with_builtins()).unwrap();

        assert_eq!(tree.len(), 4);
        let root = tree.get(tree.root());
        assert_eq!(root.type_name(), "Approval");
        assert!(root.is_a(tree.types().key(builtin::SEQUENCE).unwrap()));

        let hello = tree.node(tree.root()).children[0];
        let text = tree.node(hello).argument("Text").unwrap();
        let greeting = text.expression.unwrap();
        assert_eq!(tree.get(greeting).type_name(), "Literal<String>");
        let literal_of = tree.types().key("Literal<>").unwrap();
        assert!(tree.get(greeting).is_a(literal_of));

        let wait = tree.node(tree.root()).children[1];
        assert!(tree.node(wait).can_induce_idle);
    }

    #[test]
    fn test_unknown_references_rejected() {
        let text = r#"{ "root": "Main", "activities": [
            { "name": "Main", "type": "Sequence", "children": ["Ghost"] } ] }"#;
        let err = TreeDocument::from_json(text)
            .unwrap()
            .into_tree(&TypeRegistry::with_builtins())
            .unwrap_err();
        assert!(err.message.contains("Ghost"));

        let text = r#"{ "root": "Main", "activities": [ { "name": "Main", "type": "Nope<Int32>" } ] }"#;
        let err = TreeDocument::from_json(text)
            .unwrap()
            .into_tree(&TypeRegistry::with_builtins())
            .unwrap_err();
        assert_eq!(err.param, "type");
    }
}
