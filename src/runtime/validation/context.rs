//! Per-node view handed to constraints

use std::cell::RefCell;

use tracing::warn;

use super::LocationEnvironment;
use super::violation::ValidationError;
use crate::runtime::activity::{ActivityRef, ActivityTree, NodeIndex, NodeSet};
use crate::runtime::error::RuntimeError;
use crate::runtime::metadata::{ActivityCallStack, CachingOptions, ChildActivity, MetadataCache};

/// Context for one constraint invocation against one node
pub struct ValidationContext<'a> {
    cache: &'a MetadataCache<'a>,
    owner: NodeIndex,
    parent_chain: &'a ActivityCallStack,
    options: CachingOptions,
    environment: &'a LocationEnvironment,
    get_children_errors: RefCell<Vec<ValidationError>>,
    get_children_failure: RefCell<Option<RuntimeError>>,
}

impl<'a> ValidationContext<'a> {
    pub(crate) fn new(
        cache: &'a MetadataCache<'a>,
        owner: NodeIndex,
        parent_chain: &'a ActivityCallStack,
        options: CachingOptions,
        environment: &'a LocationEnvironment,
    ) -> Self {
        Self {
            cache,
            owner,
            parent_chain,
            options,
            environment,
            get_children_errors: RefCell::new(Vec::new()),
            get_children_failure: RefCell::new(None),
        }
    }

    /// The activity being validated
    pub fn to_validate(&self) -> ActivityRef<'a> {
        self.cache.tree().get(self.owner)
    }

    /// Tree the activity belongs to
    pub fn tree(&self) -> &'a ActivityTree {
        self.cache.tree()
    }

    /// Caching options of the current pass
    pub fn options(&self) -> CachingOptions {
        self.options
    }

    /// Variables visible to the activity
    pub fn environment(&self) -> &'a LocationEnvironment {
        self.environment
    }

    /// Ancestors of the activity, nearest first
    pub fn get_parents(&self) -> Vec<ActivityRef<'a>> {
        let tree = self.tree();
        self.parent_chain
            .ancestors()
            .map(|frame| tree.get(frame.node))
            .collect()
    }

    /// Every activity below the activity, breadth first
    ///
    /// Structural caching of the subtree is finished first; errors it
    /// uncovers are buffered on the context. If caching stops early (for
    /// example on cancellation) the nodes reachable so far are returned and
    /// the failure is raised once the constraint returns.
    pub fn get_children(&self) -> Vec<ActivityRef<'a>> {
        self.collect_subtree(self.owner, self.parent_chain)
    }

    /// The root followed by every activity below it
    pub fn get_workflow_tree(&self) -> Vec<ActivityRef<'a>> {
        let tree = self.tree();
        let root = tree.root();
        let mut nodes = vec![tree.get(root)];
        nodes.extend(self.collect_subtree(root, &ActivityCallStack::new()));
        nodes
    }

    pub(crate) fn take_get_children_errors(&self) -> Vec<ValidationError> {
        self.get_children_errors.take()
    }

    pub(crate) fn take_get_children_failure(&self) -> Option<RuntimeError> {
        self.get_children_failure.take()
    }

    fn collect_subtree(&self, start: NodeIndex, chain: &ActivityCallStack) -> Vec<ActivityRef<'a>> {
        let options = CachingOptions {
            single_level: false,
            ..self.options
        };
        let mut errors = Vec::new();
        if let Err(err) = self.cache.finish_caching_subtree(
            ChildActivity::executable(start),
            chain,
            options,
            None,
            &mut errors,
        ) {
            warn!("subtree caching for {} stopped: {}", start, err);
            let mut failure = self.get_children_failure.borrow_mut();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.get_children_errors.borrow_mut().extend(errors);

        // Imported references are listed but only expanded from their owner.
        let tree = self.tree();
        let mut seen = NodeSet::with_len(tree.len());
        let mut expanded = NodeSet::with_len(tree.len());
        seen.insert(start);
        expanded.insert(start);

        let mut found: Vec<NodeIndex> = Vec::new();
        let mut queue = vec![start];
        let mut next = 0;
        while next < queue.len() {
            let parent = queue[next];
            next += 1;
            for (child, relationship) in tree.node(parent).edges() {
                if seen.insert(child) {
                    found.push(child);
                }
                if relationship.is_owning() && expanded.insert(child) {
                    queue.push(child);
                }
            }
        }
        found.into_iter().map(|node| tree.get(node)).collect()
    }
}
