//! Activity definitions stored in an index-addressed arena
//!
//! An [`ActivityTree`] owns every node of a workflow definition. Relationships
//! (public children, implementation children, imported references and
//! argument expressions) are stored as [`NodeIndex`] edges, so shared
//! subtrees and back-references are representable without reference cycles.
//! Ownership, id-spaces and qualified ids are computed later by the metadata
//! pass (see [`super::metadata`]).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ArgumentError;
use super::metadata::TreeMetadata;
use super::types::{TypeKey, TypeRegistry};
use super::validation::constraint::Constraint;

/// Position of a node in its tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIndex(pub(crate) u32);

impl NodeIndex {
    /// Arena slot
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fixed-size bitset over arena slots
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    words: Vec<u64>,
}

impl NodeSet {
    /// Empty set able to hold `len` nodes
    pub fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
        }
    }

    /// Insert a node; returns false if it was already present
    pub fn insert(&mut self, node: NodeIndex) -> bool {
        let (word, bit) = (node.index() / 64, node.index() % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    /// Membership test
    pub fn contains(&self, node: NodeIndex) -> bool {
        let (word, bit) = (node.index() / 64, node.index() % 64);
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << bit) != 0)
    }
}

/// Data flow direction of a runtime argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgumentDirection {
    /// Supplied to the activity
    In,
    /// Produced by the activity
    Out,
    /// Both
    InOut,
}

impl ArgumentDirection {
    /// Whether values flow into the activity
    pub fn is_input(self) -> bool {
        matches!(self, ArgumentDirection::In | ArgumentDirection::InOut)
    }
}

/// Declared type of an argument value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Accepts anything
    Any,
    /// JSON boolean
    Bool,
    /// Integral number
    Int,
    /// Any number
    Float,
    /// String (nullable)
    String,
    /// Array (nullable)
    Array,
    /// Object (nullable)
    Object,
}

impl ValueType {
    /// Whether a runtime value can be assigned to an argument of this type
    ///
    /// `null` is accepted by the reference-like types only.
    pub fn is_compatible(self, value: &Value) -> bool {
        match (self, value) {
            (ValueType::Any, _) => true,
            (ValueType::String | ValueType::Array | ValueType::Object, Value::Null) => true,
            (ValueType::Bool, Value::Bool(_)) => true,
            (ValueType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ValueType::Float, Value::Number(_)) => true,
            (ValueType::String, Value::String(_)) => true,
            (ValueType::Array, Value::Array(_)) => true,
            (ValueType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Any => "Any",
            ValueType::Bool => "Boolean",
            ValueType::Int => "Int64",
            ValueType::Float => "Double",
            ValueType::String => "String",
            ValueType::Array => "Array",
            ValueType::Object => "Object",
        };
        f.write_str(name)
    }
}

/// Argument declared by an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeArgument {
    /// Argument name, unique within its activity
    pub name: String,
    /// Direction
    pub direction: ArgumentDirection,
    /// Declared value type
    pub value_type: ValueType,
    /// Must be bound (or supplied as a root input)
    #[serde(default)]
    pub is_required: bool,
    /// Overload groups this argument participates in
    #[serde(default)]
    pub overload_groups: Vec<String>,
    /// Expression activity bound to this argument
    #[serde(skip)]
    pub expression: Option<NodeIndex>,
}

impl RuntimeArgument {
    /// Optional argument
    pub fn new(name: impl Into<String>, direction: ArgumentDirection, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            direction,
            value_type,
            is_required: false,
            overload_groups: Vec::new(),
            expression: None,
        }
    }

    /// Optional `In` argument
    pub fn input(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::new(name, ArgumentDirection::In, value_type)
    }

    /// Optional `Out` argument
    pub fn output(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::new(name, ArgumentDirection::Out, value_type)
    }

    /// Mark as required
    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    /// Add to an overload group
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.overload_groups.push(group.into());
        self
    }

    /// Whether an expression is bound
    pub fn is_bound(&self) -> bool {
        self.expression.is_some()
    }
}

/// Runtime behaviour of a node, interpreted by the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityKind {
    /// Runs implementation children, then public children, in order
    Composite,
    /// Appends the value of its `Text` argument to the instance output
    WriteLine,
    /// Suspends until the named bookmark is resumed
    WaitForBookmark {
        /// Bookmark name
        bookmark: String,
    },
    /// Faults the instance
    Throw {
        /// Fault message
        message: String,
    },
    /// Constant expression
    Expression {
        /// Value produced
        value: Value,
    },
    /// Reports a validation violation when validated
    AddValidationError {
        /// Violation message
        message: String,
        /// Report as a warning
        #[serde(default)]
        is_warning: bool,
        /// Offending property
        #[serde(default)]
        property_name: Option<String>,
    },
    /// Reports a validation violation when `assertion` is false
    AssertValidation {
        /// Asserted condition
        assertion: bool,
        /// Violation message
        message: String,
        /// Report as a warning
        #[serde(default)]
        is_warning: bool,
        /// Offending property
        #[serde(default)]
        property_name: Option<String>,
    },
}

impl ActivityKind {
    fn tag(&self) -> &'static str {
        match self {
            ActivityKind::Composite => "composite",
            ActivityKind::WriteLine => "write_line",
            ActivityKind::WaitForBookmark { .. } => "wait_for_bookmark",
            ActivityKind::Throw { .. } => "throw",
            ActivityKind::Expression { .. } => "expression",
            ActivityKind::AddValidationError { .. } => "add_validation_error",
            ActivityKind::AssertValidation { .. } => "assert_validation",
        }
    }
}

/// How a node is reached from its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRelationship {
    /// Expression bound to the argument at this position
    ArgumentExpression(usize),
    /// Public child, same id-space as the parent
    Child,
    /// Reference to a node owned elsewhere in the same id-space
    ImportedChild,
    /// Private child, in the parent's implementation id-space
    ImplementationChild,
}

impl ChildRelationship {
    /// Whether the edge makes the parent the owner of the child
    pub fn is_owning(self) -> bool {
        !matches!(self, ChildRelationship::ImportedChild)
    }
}

/// One activity in the arena
#[derive(Debug, Clone)]
pub struct ActivityNode {
    /// Human readable name
    pub display_name: String,
    /// Activity type
    pub type_key: TypeKey,
    /// Runtime behaviour
    pub kind: ActivityKind,
    /// Declared arguments
    pub arguments: Vec<RuntimeArgument>,
    /// Public children
    pub children: Vec<NodeIndex>,
    /// Private implementation children
    pub implementation_children: Vec<NodeIndex>,
    /// Non-owning references
    pub imported_children: Vec<NodeIndex>,
    /// Whether executing this activity may leave the instance idle
    pub can_induce_idle: bool,
    /// Build-time constraints declared by the activity itself
    pub constraints: Vec<Constraint>,
}

impl ActivityNode {
    /// New composite activity of the given type
    pub fn new(display_name: impl Into<String>, type_key: TypeKey) -> Self {
        Self {
            display_name: display_name.into(),
            type_key,
            kind: ActivityKind::Composite,
            arguments: Vec::new(),
            children: Vec::new(),
            implementation_children: Vec::new(),
            imported_children: Vec::new(),
            can_induce_idle: false,
            constraints: Vec::new(),
        }
    }

    /// Set the runtime behaviour
    pub fn with_kind(mut self, kind: ActivityKind) -> Self {
        if matches!(kind, ActivityKind::WaitForBookmark { .. }) {
            self.can_induce_idle = true;
        }
        self.kind = kind;
        self
    }

    /// Declare an argument
    pub fn with_argument(mut self, argument: RuntimeArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Mark as able to induce idle
    pub fn inducing_idle(mut self) -> Self {
        self.can_induce_idle = true;
        self
    }

    /// Attach a build-time constraint
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Argument by name
    pub fn argument(&self, name: &str) -> Option<&RuntimeArgument> {
        self.arguments.iter().find(|arg| arg.name == name)
    }

    /// Every outgoing edge, in the order the metadata pass visits them
    pub fn edges(&self) -> impl Iterator<Item = (NodeIndex, ChildRelationship)> + '_ {
        let expressions = self
            .arguments
            .iter()
            .enumerate()
            .filter_map(|(position, arg)| {
                arg.expression
                    .map(|expr| (expr, ChildRelationship::ArgumentExpression(position)))
            });
        expressions
            .chain(self.children.iter().map(|c| (*c, ChildRelationship::Child)))
            .chain(
                self.imported_children
                    .iter()
                    .map(|c| (*c, ChildRelationship::ImportedChild)),
            )
            .chain(
                self.implementation_children
                    .iter()
                    .map(|c| (*c, ChildRelationship::ImplementationChild)),
            )
    }

    /// Whether the node has any outgoing edge
    pub fn has_non_empty_subtree(&self) -> bool {
        self.edges().next().is_some()
    }
}

/// Immutable workflow definition
pub struct ActivityTree {
    types: Arc<TypeRegistry>,
    nodes: Vec<ActivityNode>,
    root: NodeIndex,
    associated: AtomicBool,
    metadata: OnceCell<Arc<TreeMetadata>>,
}

impl ActivityTree {
    /// Start building a tree over the given type registry
    pub fn builder(types: Arc<TypeRegistry>) -> ActivityTreeBuilder {
        ActivityTreeBuilder {
            types,
            nodes: Vec::new(),
        }
    }

    /// Root node
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Node by index
    pub fn node(&self, index: NodeIndex) -> &ActivityNode {
        &self.nodes[index.index()]
    }

    /// Read-only view of a node
    pub fn get(&self, index: NodeIndex) -> ActivityRef<'_> {
        ActivityRef { tree: self, index }
    }

    /// Number of nodes in the arena
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty (never true for a built tree)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Type registry the tree was built against
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Display name of a node
    pub fn display_name(&self, index: NodeIndex) -> &str {
        &self.node(index).display_name
    }

    /// Whether a workflow instance has been created from this definition
    pub fn has_been_associated_with_an_instance(&self) -> bool {
        self.associated.load(Ordering::Acquire)
    }

    /// Mark as associated; returns false if it already was
    pub(crate) fn associate_with_instance(&self) -> bool {
        !self.associated.swap(true, Ordering::AcqRel)
    }

    /// Metadata committed by a full caching pass
    pub fn metadata(&self) -> Option<&Arc<TreeMetadata>> {
        self.metadata.get()
    }

    /// Commit metadata; the first commit wins
    pub(crate) fn commit_metadata(&self, metadata: TreeMetadata) -> &Arc<TreeMetadata> {
        self.metadata.get_or_init(|| Arc::new(metadata))
    }

    /// Structural fingerprint of the definition
    ///
    /// Covers names, types, behaviours, arguments and edges. Constraints are
    /// code and are not part of the fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.root.0.to_le_bytes());
        for node in &self.nodes {
            hasher.update(node.display_name.as_bytes());
            hasher.update(&[0]);
            hasher.update(self.types.name(node.type_key).as_bytes());
            hasher.update(&[0]);
            hasher.update(node.kind.tag().as_bytes());
            hasher.update(&[node.can_induce_idle as u8]);
            for arg in &node.arguments {
                hasher.update(arg.name.as_bytes());
                hasher.update(&[arg.direction as u8, arg.is_required as u8]);
                if let Some(expr) = arg.expression {
                    hasher.update(&expr.0.to_le_bytes());
                }
            }
            for (child, relationship) in node.edges() {
                let tag: u8 = match relationship {
                    ChildRelationship::ArgumentExpression(_) => 1,
                    ChildRelationship::Child => 2,
                    ChildRelationship::ImportedChild => 3,
                    ChildRelationship::ImplementationChild => 4,
                };
                hasher.update(&[tag]);
                hasher.update(&child.0.to_le_bytes());
            }
            hasher.update(&[0xff]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Debug for ActivityTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityTree")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .field("associated", &self.has_been_associated_with_an_instance())
            .finish()
    }
}

/// Borrowed view of one node
#[derive(Clone, Copy)]
pub struct ActivityRef<'a> {
    tree: &'a ActivityTree,
    index: NodeIndex,
}

impl<'a> ActivityRef<'a> {
    /// Arena index
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Underlying node
    pub fn node(&self) -> &'a ActivityNode {
        self.tree.node(self.index)
    }

    /// Display name
    pub fn display_name(&self) -> &'a str {
        &self.node().display_name
    }

    /// Type key
    pub fn type_key(&self) -> TypeKey {
        self.node().type_key
    }

    /// Type name
    pub fn type_name(&self) -> &'a str {
        self.tree.types.name(self.node().type_key)
    }

    /// Runtime behaviour
    pub fn kind(&self) -> &'a ActivityKind {
        &self.node().kind
    }

    /// Declared arguments
    pub fn arguments(&self) -> &'a [RuntimeArgument] {
        &self.node().arguments
    }

    /// Whether the activity's type is `target` or derives from it
    pub fn is_a(&self, target: TypeKey) -> bool {
        self.tree.types.is_assignable_to(self.type_key(), target)
    }
}

impl fmt::Debug for ActivityRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}('{}')", self.index, self.display_name())
    }
}

impl PartialEq for ActivityRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.tree, other.tree) && self.index == other.index
    }
}

/// Incremental construction of an [`ActivityTree`]
pub struct ActivityTreeBuilder {
    types: Arc<TypeRegistry>,
    nodes: Vec<ActivityNode>,
}

impl ActivityTreeBuilder {
    /// Add a node, returning its index
    pub fn add(&mut self, node: ActivityNode) -> NodeIndex {
        let index = NodeIndex(self.nodes.len() as u32);
        self.nodes.push(node);
        index
    }

    /// Add a composite node of a registered type
    pub fn activity(&mut self, type_name: &str, display_name: &str) -> Result<NodeIndex, ArgumentError> {
        let type_key = self.types.key(type_name).ok_or_else(|| {
            ArgumentError::new("type_name", format!("unknown activity type '{type_name}'"))
        })?;
        Ok(self.add(ActivityNode::new(display_name, type_key)))
    }

    /// Mutable access to a node added earlier
    pub fn node_mut(&mut self, index: NodeIndex) -> Result<&mut ActivityNode, ArgumentError> {
        self.nodes
            .get_mut(index.index())
            .ok_or_else(|| ArgumentError::new("index", format!("unknown node {index}")))
    }

    /// Append a public child
    pub fn child(&mut self, parent: NodeIndex, child: NodeIndex) -> Result<(), ArgumentError> {
        self.check(child)?;
        self.node_mut(parent)?.children.push(child);
        Ok(())
    }

    /// Append a private implementation child
    pub fn implementation_child(&mut self, parent: NodeIndex, child: NodeIndex) -> Result<(), ArgumentError> {
        self.check(child)?;
        self.node_mut(parent)?.implementation_children.push(child);
        Ok(())
    }

    /// Append a non-owning reference
    pub fn import(&mut self, parent: NodeIndex, child: NodeIndex) -> Result<(), ArgumentError> {
        self.check(child)?;
        self.node_mut(parent)?.imported_children.push(child);
        Ok(())
    }

    /// Bind an expression activity to a declared argument
    pub fn bind(&mut self, parent: NodeIndex, argument: &str, expression: NodeIndex) -> Result<(), ArgumentError> {
        self.check(expression)?;
        let node = self.node_mut(parent)?;
        let display = node.display_name.clone();
        let arg = node
            .arguments
            .iter_mut()
            .find(|arg| arg.name == argument)
            .ok_or_else(|| {
                ArgumentError::new(
                    "argument",
                    format!("activity '{display}' declares no argument named '{argument}'"),
                )
            })?;
        arg.expression = Some(expression);
        Ok(())
    }

    /// Type registry in use
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Finish with the given root
    pub fn build(self, root: NodeIndex) -> Result<ActivityTree, ArgumentError> {
        self.check(root)?;
        Ok(ActivityTree {
            types: self.types,
            nodes: self.nodes,
            root,
            associated: AtomicBool::new(false),
            metadata: OnceCell::new(),
        })
    }

    fn check(&self, index: NodeIndex) -> Result<(), ArgumentError> {
        if index.index() < self.nodes.len() {
            Ok(())
        } else {
            Err(ArgumentError::new("index", format!("unknown node {index}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::builtin;

    #[test]
    fn test_node_set() {
        let mut set = NodeSet::with_len(10);
        assert!(set.insert(NodeIndex(3)));
        assert!(!set.insert(NodeIndex(3)));
        assert!(set.contains(NodeIndex(3)));
        assert!(!set.contains(NodeIndex(4)));
        // grows past the initial size
        assert!(set.insert(NodeIndex(200)));
        assert!(set.contains(NodeIndex(200)));
    }

    #[test]
    fn test_value_type_compatibility() {
        assert!(ValueType::Int.is_compatible(&serde_json::json!(3)));
        assert!(!ValueType::Int.is_compatible(&serde_json::json!(3.5)));
        assert!(ValueType::Float.is_compatible(&serde_json::json!(3)));
        assert!(ValueType::String.is_compatible(&Value::Null));
        assert!(!ValueType::Bool.is_compatible(&Value::Null));
        assert!(ValueType::Any.is_compatible(&serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_builder_binds_expressions_and_rejects_unknown_arguments() {
        let types = Arc::new(TypeRegistry::with_builtins());
        let mut builder = ActivityTree::builder(types.clone());
        let write = builder.add(
            ActivityNode::new("Write", types.key(builtin::WRITE_LINE).unwrap())
                .with_kind(ActivityKind::WriteLine)
                .with_argument(RuntimeArgument::input("Text", ValueType::String).required()),
        );
        let text = builder.add(
            ActivityNode::new("Literal", types.key(builtin::WRITE_LINE).unwrap())
                .with_kind(ActivityKind::Expression { value: "hi".into() }),
        );

        builder.bind(write, "Text", text).unwrap();
        assert!(builder.bind(write, "Missing", text).is_err());

        let tree = builder.build(write).unwrap();
        let edges: Vec<_> = tree.node(write).edges().collect();
        assert_eq!(edges, vec![(text, ChildRelationship::ArgumentExpression(0))]);
        assert!(tree.node(write).has_non_empty_subtree());
    }

    #[test]
    fn test_fingerprint_is_structural() {
        let types = Arc::new(TypeRegistry::with_builtins());
        let build = |name: &str| {
            let mut builder = ActivityTree::builder(types.clone());
            let root = builder.activity(builtin::SEQUENCE, name).unwrap();
            let child = builder.activity(builtin::SEQUENCE, "Child").unwrap();
            builder.child(root, child).unwrap();
            builder.build(root).unwrap()
        };

        assert_eq!(build("Root").fingerprint(), build("Root").fingerprint());
        assert_ne!(build("Root").fingerprint(), build("Other").fingerprint());
    }

    #[test]
    fn test_association_is_once_only() {
        let types = Arc::new(TypeRegistry::with_builtins());
        let mut builder = ActivityTree::builder(types);
        let root = builder.activity(builtin::SEQUENCE, "Root").unwrap();
        let tree = builder.build(root).unwrap();

        assert!(!tree.has_been_associated_with_an_instance());
        assert!(tree.associate_with_instance());
        assert!(!tree.associate_with_instance());
        assert!(tree.has_been_associated_with_an_instance());
    }
}
