//! Structural caching pass over an activity tree
//!
//! Walks the arena iteratively (explicit stack, no recursion), assigns every
//! owned node a parent, an id-space and a local id, and records structural
//! errors: shared or cyclic ownership, imported references that cross an
//! id-space, missing required arguments, overload-group misconfiguration and
//! violations declared inline with `AddValidationError`/`AssertValidation`.
//!
//! A node is expanded only from its owner and at most once per walk, so
//! shared subtrees and back-references terminate.

use std::cell::RefCell;
use std::collections::BTreeSet;

use tracing::{debug, trace};

use super::activity::{
    ActivityKind, ActivityNode, ActivityTree, ChildRelationship, NodeIndex, NodeSet, RuntimeArgument,
};
use super::error::{Result, RuntimeError};
use super::validation::dispatch::generate_validation_error_prefix;
use super::validation::violation::{ErrorSource, ValidationError};
use super::validation::CancellationToken;

/// Position of an id-space in [`TreeMetadata`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdSpaceIndex(pub(crate) u32);

/// An identity scope
///
/// The root id-space has no owner. Every other id-space belongs to the
/// activity whose implementation it holds and is private: its members cannot
/// be looked up by public id.
#[derive(Debug, Clone, Default)]
pub struct IdSpace {
    /// Activity whose implementation this id-space holds
    pub owner: Option<NodeIndex>,
    /// Members in id order (local id = position + 1)
    pub members: Vec<NodeIndex>,
}

impl IdSpace {
    /// Whether members are hidden from public lookup
    pub fn is_private(&self) -> bool {
        self.owner.is_some()
    }
}

/// Per-node results of the caching pass
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    /// Owning activity
    pub parent: Option<NodeIndex>,
    /// Id-space the node is a member of
    pub member_of: IdSpaceIndex,
    /// Id within `member_of`
    pub local_id: u32,
    /// Id-space holding this node's implementation children
    pub implementation_space: Option<IdSpaceIndex>,
    /// Argument this node is bound to, as (owner, argument position)
    pub bound_argument: Option<(NodeIndex, usize)>,
    /// Whether structural checks have run for this node
    pub is_cached: bool,
}

#[derive(Debug, Clone)]
struct PendingImport {
    importer: NodeIndex,
    target: NodeIndex,
    chain: ActivityCallStack,
}

/// Ownership, id-spaces and ids for one tree
#[derive(Debug, Clone)]
pub struct TreeMetadata {
    root: NodeIndex,
    nodes: Vec<Option<NodeMetadata>>,
    spaces: Vec<IdSpace>,
    pending_imports: Vec<PendingImport>,
}

impl TreeMetadata {
    /// Fresh metadata with only the root placed
    pub fn new(tree: &ActivityTree) -> Self {
        let root = tree.root();
        let mut metadata = Self {
            root,
            nodes: vec![None; tree.len()],
            spaces: vec![IdSpace {
                owner: None,
                members: vec![root],
            }],
            pending_imports: Vec::new(),
        };
        metadata.nodes[root.index()] = Some(NodeMetadata {
            parent: None,
            member_of: IdSpaceIndex(0),
            local_id: 1,
            implementation_space: None,
            bound_argument: None,
            is_cached: false,
        });
        metadata
    }

    /// Metadata for a node the pass has reached
    pub fn get(&self, node: NodeIndex) -> Option<&NodeMetadata> {
        self.nodes.get(node.index()).and_then(Option::as_ref)
    }

    /// Owning activity
    pub fn parent(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.get(node).and_then(|meta| meta.parent)
    }

    /// Id-space the node belongs to
    pub fn member_of(&self, node: NodeIndex) -> Option<IdSpaceIndex> {
        self.get(node).map(|meta| meta.member_of)
    }

    /// Id-space by index
    pub fn space(&self, space: IdSpaceIndex) -> &IdSpace {
        &self.spaces[space.0 as usize]
    }

    /// Owner of the id-space the node belongs to
    pub fn space_owner(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.member_of(node).and_then(|space| self.space(space).owner)
    }

    /// Whether the node lives in a private (implementation) id-space
    pub fn is_private(&self, node: NodeIndex) -> bool {
        self.space_owner(node).is_some()
    }

    /// Number of private id-spaces between the node and the root id-space
    pub fn private_depth(&self, node: NodeIndex) -> usize {
        let mut depth = 0;
        let mut current = node;
        while let Some(owner) = self.space_owner(current) {
            depth += 1;
            current = owner;
        }
        depth
    }

    /// Whether the node is bound to an argument of its parent
    pub fn is_expression_root(&self, node: NodeIndex) -> bool {
        self.bound_argument(node).is_some()
    }

    /// Argument the node is bound to, as (owner, argument position)
    pub fn bound_argument(&self, node: NodeIndex) -> Option<(NodeIndex, usize)> {
        self.get(node).and_then(|meta| meta.bound_argument)
    }

    /// Whether structural checks have run for the node
    pub fn is_cached(&self, node: NodeIndex) -> bool {
        self.get(node).is_some_and(|meta| meta.is_cached)
    }

    /// Dotted id, e.g. `"3"` for a public node or `"3.2"` for the second
    /// member of node 3's implementation
    pub fn qualified_id(&self, node: NodeIndex) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = node;
        loop {
            let meta = self.get(current)?;
            segments.push(meta.local_id.to_string());
            match self.space(meta.member_of).owner {
                Some(owner) => current = owner,
                None => break,
            }
        }
        segments.reverse();
        Some(segments.join("."))
    }

    /// Look up a member of the root id-space by id
    ///
    /// Qualified ids pointing into an implementation are private and never
    /// resolve.
    pub fn resolve_public(&self, id: &str) -> Option<NodeIndex> {
        if id.contains('.') {
            return None;
        }
        let local: usize = id.trim().parse().ok()?;
        let members = &self.spaces[0].members;
        local.checked_sub(1).and_then(|slot| members.get(slot)).copied()
    }

    /// Root of the tree
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    fn mark_cached(&mut self, node: NodeIndex) {
        if let Some(meta) = self.nodes[node.index()].as_mut() {
            meta.is_cached = true;
        }
    }

    fn implementation_space_for(&mut self, owner: NodeIndex) -> IdSpaceIndex {
        if let Some(space) = self.get(owner).and_then(|meta| meta.implementation_space) {
            return space;
        }
        let space = IdSpaceIndex(self.spaces.len() as u32);
        self.spaces.push(IdSpace {
            owner: Some(owner),
            members: Vec::new(),
        });
        if let Some(meta) = self.nodes[owner.index()].as_mut() {
            meta.implementation_space = Some(space);
        }
        space
    }

    fn claim(&mut self, child: NodeIndex, parent: NodeIndex, relationship: ChildRelationship) -> Claim {
        match self.get(child) {
            Some(meta) if meta.parent == Some(parent) => return Claim::Owned,
            Some(meta) => return Claim::Conflict(meta.parent),
            None => {}
        }

        let space = match relationship {
            ChildRelationship::ImplementationChild => self.implementation_space_for(parent),
            _ => match self.member_of(parent) {
                Some(space) => space,
                None => return Claim::Conflict(None),
            },
        };
        let members = &mut self.spaces[space.0 as usize].members;
        members.push(child);
        let local_id = members.len() as u32;

        let bound_argument = match relationship {
            ChildRelationship::ArgumentExpression(position) => Some((parent, position)),
            _ => None,
        };
        self.nodes[child.index()] = Some(NodeMetadata {
            parent: Some(parent),
            member_of: space,
            local_id,
            implementation_space: None,
            bound_argument,
            is_cached: false,
        });
        Claim::Fresh
    }
}

enum Claim {
    Fresh,
    Owned,
    Conflict(Option<NodeIndex>),
}

/// Node reached during a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildActivity {
    /// Node reached
    pub node: NodeIndex,
    /// False for non-owning references
    pub can_be_executed: bool,
}

impl ChildActivity {
    /// Owned node
    pub fn executable(node: NodeIndex) -> Self {
        Self {
            node,
            can_be_executed: true,
        }
    }

    /// Non-owning reference
    pub fn reference(node: NodeIndex) -> Self {
        Self {
            node,
            can_be_executed: false,
        }
    }
}

/// Ancestors of the node currently being visited, outermost first
#[derive(Debug, Clone, Default)]
pub struct ActivityCallStack {
    frames: Vec<ChildActivity>,
}

impl ActivityCallStack {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Depth
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the stack is empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Push an ancestor
    pub fn push(&mut self, frame: ChildActivity) {
        self.frames.push(frame);
    }

    /// Drop frames deeper than `len`
    pub fn truncate(&mut self, len: usize) {
        self.frames.truncate(len);
    }

    /// Immediate parent frame
    pub fn parent(&self) -> Option<ChildActivity> {
        self.frames.last().copied()
    }

    /// Whether every ancestor executes
    pub fn will_execute(&self) -> bool {
        self.frames.iter().all(|frame| frame.can_be_executed)
    }

    /// Ancestors, nearest first
    pub fn ancestors(&self) -> impl Iterator<Item = ChildActivity> + '_ {
        self.frames.iter().rev().copied()
    }

    /// Ancestors, outermost first
    pub fn iter(&self) -> impl Iterator<Item = ChildActivity> + '_ {
        self.frames.iter().copied()
    }
}

/// Whether caching results are committed onto the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingMode {
    /// Commit the computed metadata to the tree
    Full,
    /// Compute, validate, discard
    ValidationOnly,
}

/// Options for one caching pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachingOptions {
    /// Commit or discard
    pub mode: CachingMode,
    /// Skip the root's own configuration checks (build-time validation)
    pub skip_root_configuration_validation: bool,
    /// Metadata is being prepared for an instance
    pub prepare_for_runtime: bool,
    /// Only the first level is cached; deeper subtrees are cached on demand
    pub single_level: bool,
}

impl CachingOptions {
    /// Full caching, every check enabled
    pub const fn full() -> Self {
        Self {
            mode: CachingMode::Full,
            skip_root_configuration_validation: false,
            prepare_for_runtime: false,
            single_level: false,
        }
    }

    /// Validation without committing results
    pub const fn validation() -> Self {
        Self {
            mode: CachingMode::ValidationOnly,
            ..Self::full()
        }
    }

    /// Full caching in preparation for running an instance
    pub const fn runtime() -> Self {
        Self {
            prepare_for_runtime: true,
            ..Self::full()
        }
    }
}

/// Callback invoked for every executable node a walk reaches
pub type VisitCallback<'c> = dyn FnMut(ChildActivity, &ActivityCallStack) -> Result<()> + 'c;

/// Caching pass state for one tree
///
/// Methods take `&self` so constraints can force subtree caching while the
/// walk that invoked them is suspended in its callback.
pub struct MetadataCache<'t> {
    tree: &'t ActivityTree,
    state: RefCell<TreeMetadata>,
    cancellation: Option<CancellationToken>,
}

impl<'t> MetadataCache<'t> {
    /// Empty cache for a tree
    pub fn new(tree: &'t ActivityTree) -> Self {
        Self {
            tree,
            state: RefCell::new(TreeMetadata::new(tree)),
            cancellation: None,
        }
    }

    /// Observe a cancellation token between nodes
    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Tree being cached
    pub fn tree(&self) -> &'t ActivityTree {
        self.tree
    }

    /// Read the metadata computed so far
    pub fn read<R>(&self, f: impl FnOnce(&TreeMetadata) -> R) -> R {
        f(&self.state.borrow())
    }

    /// Consume the cache
    pub fn into_metadata(self) -> TreeMetadata {
        self.state.into_inner()
    }

    /// Cache the whole tree from its root
    pub fn cache_root(
        &self,
        options: CachingOptions,
        callback: &mut VisitCallback<'_>,
        errors: &mut Vec<ValidationError>,
    ) -> Result<()> {
        let root = ChildActivity::executable(self.tree.root());
        let before = errors.len();
        self.walk(root, &ActivityCallStack::new(), options, Some(callback), errors)?;
        self.check_imports(options, errors);
        debug!(
            "cached '{}' ({:?}): {} structural error(s)",
            self.tree.display_name(self.tree.root()),
            options.mode,
            errors.len() - before
        );
        Ok(())
    }

    /// Finish caching the subtree below `subtree`
    ///
    /// Nodes already cached are re-visited (for the callback) but not
    /// re-checked, so each structural error is reported once.
    pub fn finish_caching_subtree(
        &self,
        subtree: ChildActivity,
        parent_chain: &ActivityCallStack,
        options: CachingOptions,
        callback: Option<&mut VisitCallback<'_>>,
        errors: &mut Vec<ValidationError>,
    ) -> Result<()> {
        self.walk(subtree, parent_chain, options, callback, errors)?;
        self.check_imports(options, errors);
        Ok(())
    }

    fn walk(
        &self,
        start: ChildActivity,
        parent_chain: &ActivityCallStack,
        options: CachingOptions,
        mut callback: Option<&mut VisitCallback<'_>>,
        errors: &mut Vec<ValidationError>,
    ) -> Result<()> {
        let base = parent_chain.len();
        let mut chain = parent_chain.clone();
        let mut visited = NodeSet::with_len(self.tree.len());
        let mut stack = vec![(start, base)];

        while let Some((current, depth)) = stack.pop() {
            if self
                .cancellation
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                trace!("caching cancelled before {}", current.node);
                return Err(RuntimeError::Cancelled);
            }

            chain.truncate(depth);
            let children = {
                let mut state = self.state.borrow_mut();
                self.process_activity(&mut state, current, &chain, options, depth == base, &mut visited, errors)
            };

            if current.can_be_executed && chain.will_execute() {
                if let Some(callback) = callback.as_deref_mut() {
                    callback(current, &chain)?;
                }
            }

            if children.is_empty() {
                continue;
            }
            chain.push(current);
            for child in children.into_iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_activity(
        &self,
        state: &mut TreeMetadata,
        current: ChildActivity,
        chain: &ActivityCallStack,
        options: CachingOptions,
        at_start: bool,
        visited: &mut NodeSet,
        errors: &mut Vec<ValidationError>,
    ) -> Vec<ChildActivity> {
        if !current.can_be_executed || !visited.insert(current.node) {
            return Vec::new();
        }
        if options.single_level && !at_start {
            return Vec::new();
        }

        let node = self.tree.node(current.node);
        // Edges of an already cached node were claimed and checked then
        let first_visit = !state.is_cached(current.node);
        if first_visit {
            let is_root = current.node == self.tree.root();
            if !(is_root && options.skip_root_configuration_validation) {
                // At runtime the root's arguments come from the input map
                let check_arguments = !(is_root && options.prepare_for_runtime);
                self.check_configuration(state, current.node, chain, options, check_arguments, errors);
            }
            state.mark_cached(current.node);
        }

        let mut children = Vec::new();
        for (child, relationship) in node.edges() {
            if !relationship.is_owning() {
                if first_visit {
                    state.pending_imports.push(PendingImport {
                        importer: current.node,
                        target: child,
                        chain: chain.clone(),
                    });
                }
                children.push(ChildActivity::reference(child));
                continue;
            }

            match state.claim(child, current.node, relationship) {
                Claim::Fresh | Claim::Owned => children.push(ChildActivity::executable(child)),
                Claim::Conflict(_) if !first_visit => {}
                Claim::Conflict(owner) => {
                    let message = match owner {
                        Some(owner) => format!(
                            "The activity '{}' cannot be a child of '{}' because it already belongs to '{}'. \
                             An activity can have only one owner; reference it as an imported child to share it.",
                            self.tree.display_name(child),
                            node.display_name,
                            self.tree.display_name(owner),
                        ),
                        None => format!(
                            "The activity '{}' cannot be a child of '{}' because it is the root of the tree.",
                            self.tree.display_name(child),
                            node.display_name,
                        ),
                    };
                    errors.push(self.attributed(state, ValidationError::new(message), current.node, chain, options));
                }
            }
        }
        children
    }

    fn check_configuration(
        &self,
        state: &TreeMetadata,
        node: NodeIndex,
        chain: &ActivityCallStack,
        options: CachingOptions,
        check_arguments: bool,
        errors: &mut Vec<ValidationError>,
    ) {
        let activity = self.tree.node(node);
        if check_arguments {
            for (message, property) in argument_violations(activity, RuntimeArgument::is_bound) {
                let mut error = ValidationError::new(message);
                error.property_name = property;
                errors.push(self.attributed(state, error, node, chain, options));
            }
        }

        let inline = match &activity.kind {
            ActivityKind::AddValidationError {
                message,
                is_warning,
                property_name,
            } => Some((message, *is_warning, property_name)),
            ActivityKind::AssertValidation {
                assertion: false,
                message,
                is_warning,
                property_name,
            } => Some((message, *is_warning, property_name)),
            _ => None,
        };
        if let Some((message, is_warning, property_name)) = inline {
            let mut error = ValidationError::new(message.clone());
            error.is_warning = is_warning;
            error.property_name = property_name.clone();
            errors.push(self.attributed(state, error, node, chain, options));
        }
    }

    fn check_imports(&self, options: CachingOptions, errors: &mut Vec<ValidationError>) {
        let mut state = self.state.borrow_mut();
        let pending = std::mem::take(&mut state.pending_imports);
        for import in pending {
            let message = match (state.member_of(import.importer), state.member_of(import.target)) {
                (_, None) if options.single_level => {
                    // Owner not reached yet; decided when the subtree is cached.
                    state.pending_imports.push(import);
                    continue;
                }
                (_, None) => format!(
                    "The activity '{}' referenced by '{}' is not owned by any activity in the tree.",
                    self.tree.display_name(import.target),
                    self.tree.display_name(import.importer),
                ),
                (Some(importer_space), Some(target_space)) if importer_space != target_space => format!(
                    "The activity '{}' cannot be referenced by '{}' because they belong to different id-spaces.",
                    self.tree.display_name(import.target),
                    self.tree.display_name(import.importer),
                ),
                _ => continue,
            };
            let error = self.attributed(&state, ValidationError::new(message), import.importer, &import.chain, options);
            errors.push(error);
        }
    }

    fn attributed(
        &self,
        state: &TreeMetadata,
        mut error: ValidationError,
        node: NodeIndex,
        chain: &ActivityCallStack,
        options: CachingOptions,
    ) -> ValidationError {
        let (prefix, source) = generate_validation_error_prefix(self.tree, state, node, chain, options);
        if !prefix.is_empty() {
            error.message = format!("{prefix}{}", error.message);
        }
        error.attribute(
            ErrorSource::new(source, self.tree.display_name(source)),
            state.qualified_id(source),
        );
        error
    }
}

/// Required-argument and overload-group violations for one activity
///
/// `is_set` decides whether an argument counts as supplied: bound to an
/// expression for definitions, present in the input map for root inputs.
pub(crate) fn argument_violations(
    activity: &ActivityNode,
    is_set: impl Fn(&RuntimeArgument) -> bool,
) -> Vec<(String, Option<String>)> {
    let mut violations = Vec::new();

    for arg in &activity.arguments {
        if arg.is_required && arg.overload_groups.is_empty() && !is_set(arg) {
            violations.push((
                format!("Value for a required activity argument '{}' was not supplied.", arg.name),
                Some(arg.name.clone()),
            ));
        }
    }

    let groups: BTreeSet<&str> = activity
        .arguments
        .iter()
        .flat_map(|arg| arg.overload_groups.iter().map(String::as_str))
        .collect();
    if groups.is_empty() {
        return violations;
    }

    let configured: Vec<&str> = groups
        .iter()
        .copied()
        .filter(|group| {
            let mut members = activity
                .arguments
                .iter()
                .filter(|arg| arg.overload_groups.iter().any(|g| g == group));
            let mut any_set = false;
            let all_required_set = members.all(|arg| {
                let set = is_set(arg);
                any_set |= set;
                set || !arg.is_required
            });
            any_set && all_required_set
        })
        .collect();

    let listed = groups.iter().copied().collect::<Vec<_>>().join(", ");
    match configured.len() {
        0 => violations.push((
            format!(
                "None of the overload groups of activity '{}' is configured. Configure exactly one of: {}.",
                activity.display_name, listed
            ),
            None,
        )),
        1 => {}
        _ => violations.push((
            format!(
                "More than one overload group of activity '{}' is configured ({}). Configure exactly one of: {}.",
                activity.display_name,
                configured.join(", "),
                listed
            ),
            None,
        )),
    }
    violations
}
