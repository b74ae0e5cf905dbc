//! Execution engine contract and the sequential reference engine
//!
//! The instance controller drives an engine only through [`ExecutionEngine`].
//! [`SequentialEngine`] executes a tree depth first: a composite activity
//! schedules its implementation children, then its public children, in
//! order. Imported children are references and never execute.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use super::activity::{ActivityKind, ActivityTree, NodeIndex};
use super::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult, BookmarkScope};
use super::error::{EngineError, EngineResult};

/// Execution state of the root activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    /// Still running or suspended
    Executing,
    /// Completed successfully
    Closed,
    /// Completed by cancellation
    Canceled,
    /// Completed with a fault
    Faulted,
}

/// What the instance controller needs from an execution engine
pub trait ExecutionEngine: Send + Sized {
    /// Start a new run of `tree` with the given root inputs
    fn start(tree: Arc<ActivityTree>, inputs: BTreeMap<String, Value>) -> EngineResult<Self>;

    /// Recreate an engine from state produced by [`prepare_for_serialization`]
    ///
    /// [`prepare_for_serialization`]: ExecutionEngine::prepare_for_serialization
    fn rehydrate(tree: Arc<ActivityTree>, state: Value) -> EngineResult<Self>;

    /// Nothing can make progress until the host resumes a bookmark
    fn is_idle(&self) -> bool;

    /// State of the root activity
    fn state(&self) -> ActivityInstanceState;

    /// Whether [`run`](ExecutionEngine::run) is currently executing
    fn is_running(&self) -> bool;

    /// Execute until idle, complete, or paused
    fn run(&mut self) -> EngineResult<()>;

    /// Stop at the next step boundary
    fn pause_scheduler(&mut self);

    /// Stop at the next point where the state can be persisted
    fn pause_when_persistable(&mut self);

    /// Cancel the root activity; processed by the next run
    fn cancel_root_activity(&mut self);

    /// Fault the root activity with `reason`
    fn terminate(&mut self, reason: &str);

    /// Resume a bookmark with a value
    fn try_resume_bookmark(&mut self, bookmark: &Bookmark, value: Value, scope: BookmarkScope)
    -> BookmarkResumptionResult;

    /// Registered bookmarks, optionally restricted to one scope
    fn bookmarks(&self, scope: Option<BookmarkScope>) -> Vec<BookmarkInfo>;

    /// Variables exposed to the host
    fn mappable_variables(&self) -> BTreeMap<String, Value>;

    /// Whether the state can be serialized right now
    fn is_persistable(&self) -> bool;

    /// Serializable engine state
    fn prepare_for_serialization(&mut self) -> EngineResult<Value>;

    /// Force-stop; the engine accepts no further work
    fn abort(&mut self, reason: &str);

    /// Release resources
    fn dispose(&mut self);

    /// Reason the root activity faulted, if it did
    fn fault_reason(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Waiting {
    bookmark: Bookmark,
    scope: BookmarkScope,
    owner: NodeIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EngineState {
    instance_state: ActivityInstanceState,
    // Work stack; the next activity to execute is on top.
    pending: Vec<NodeIndex>,
    waiting: Option<Waiting>,
    variables: BTreeMap<String, Value>,
    output: Vec<String>,
    started: bool,
    cancel_requested: bool,
    fault: Option<String>,
}

/// In-crate reference engine
#[derive(Debug)]
pub struct SequentialEngine {
    tree: Arc<ActivityTree>,
    state: EngineState,
    pause_requested: bool,
    pause_when_persistable: bool,
    running: bool,
    aborted: Option<String>,
}

impl SequentialEngine {
    /// Lines written by `WriteLine` activities
    pub fn output(&self) -> &[String] {
        &self.state.output
    }

    fn step(&mut self, node: NodeIndex) {
        let activity = self.tree.node(node);
        trace!("executing {} '{}'", node, activity.display_name);
        match &activity.kind {
            ActivityKind::Composite => {
                let scheduled = activity
                    .implementation_children
                    .iter()
                    .chain(activity.children.iter())
                    .rev();
                self.state.pending.extend(scheduled);
            }
            ActivityKind::WriteLine => {
                let line = match self.evaluate(node, "Text") {
                    Value::String(text) => text,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                self.state.output.push(line);
            }
            ActivityKind::WaitForBookmark { bookmark } => {
                debug!("'{}' waiting on bookmark '{}'", activity.display_name, bookmark);
                self.state.waiting = Some(Waiting {
                    bookmark: Bookmark::new(bookmark.as_str()),
                    scope: BookmarkScope::Default,
                    owner: node,
                });
            }
            ActivityKind::Throw { message } => {
                let reason = message.clone();
                self.fault(reason);
            }
            // Expressions are evaluated by the activities they are bound to;
            // validation activities only act at validation time.
            ActivityKind::Expression { .. }
            | ActivityKind::AddValidationError { .. }
            | ActivityKind::AssertValidation { .. } => {}
        }
    }

    fn evaluate(&self, node: NodeIndex, argument: &str) -> Value {
        let Some(arg) = self.tree.node(node).argument(argument) else {
            return Value::Null;
        };
        match arg.expression.map(|expr| &self.tree.node(expr).kind) {
            Some(ActivityKind::Expression { value }) => value.clone(),
            _ => self.state.variables.get(argument).cloned().unwrap_or(Value::Null),
        }
    }

    fn fault(&mut self, reason: String) {
        debug!("root activity faulted: {}", reason);
        self.state.instance_state = ActivityInstanceState::Faulted;
        self.state.fault = Some(reason);
        self.state.pending.clear();
        self.state.waiting = None;
    }

    fn check_indices(tree: &ActivityTree, state: &EngineState) -> EngineResult<()> {
        let in_range = |node: &NodeIndex| node.index() < tree.len();
        let waiting_ok = state.waiting.as_ref().is_none_or(|waiting| in_range(&waiting.owner));
        if state.pending.iter().all(in_range) && waiting_ok {
            Ok(())
        } else {
            Err(EngineError::InvalidState(
                "persisted state references activities the definition does not have".to_string(),
            ))
        }
    }
}

impl ExecutionEngine for SequentialEngine {
    fn start(tree: Arc<ActivityTree>, inputs: BTreeMap<String, Value>) -> EngineResult<Self> {
        let root = tree.root();
        Ok(Self {
            tree,
            state: EngineState {
                instance_state: ActivityInstanceState::Executing,
                pending: vec![root],
                waiting: None,
                variables: inputs,
                output: Vec::new(),
                started: false,
                cancel_requested: false,
                fault: None,
            },
            pause_requested: false,
            pause_when_persistable: false,
            running: false,
            aborted: None,
        })
    }

    fn rehydrate(tree: Arc<ActivityTree>, state: Value) -> EngineResult<Self> {
        let state: EngineState = serde_json::from_value(state)?;
        Self::check_indices(&tree, &state)?;
        Ok(Self {
            tree,
            state,
            pause_requested: false,
            pause_when_persistable: false,
            running: false,
            aborted: None,
        })
    }

    fn is_idle(&self) -> bool {
        if self.aborted.is_some() || self.state.instance_state != ActivityInstanceState::Executing {
            return true;
        }
        if !self.state.started || self.state.cancel_requested {
            return false;
        }
        self.state.waiting.is_some()
    }

    fn state(&self) -> ActivityInstanceState {
        self.state.instance_state
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn run(&mut self) -> EngineResult<()> {
        if let Some(reason) = &self.aborted {
            return Err(EngineError::InvalidState(format!("engine was aborted: {reason}")));
        }
        self.running = true;
        self.state.started = true;

        while self.state.instance_state == ActivityInstanceState::Executing {
            if self.state.cancel_requested {
                self.state.pending.clear();
                self.state.waiting = None;
                self.state.cancel_requested = false;
                self.state.instance_state = ActivityInstanceState::Canceled;
                break;
            }
            if self.pause_requested || (self.pause_when_persistable && self.is_persistable()) {
                break;
            }
            if self.state.waiting.is_some() {
                break;
            }
            match self.state.pending.pop() {
                Some(node) => self.step(node),
                None => self.state.instance_state = ActivityInstanceState::Closed,
            }
        }

        self.pause_requested = false;
        self.pause_when_persistable = false;
        self.running = false;
        Ok(())
    }

    fn pause_scheduler(&mut self) {
        self.pause_requested = true;
    }

    fn pause_when_persistable(&mut self) {
        self.pause_when_persistable = true;
    }

    fn cancel_root_activity(&mut self) {
        if self.state.instance_state == ActivityInstanceState::Executing {
            self.state.cancel_requested = true;
        }
    }

    fn terminate(&mut self, reason: &str) {
        if self.state.instance_state == ActivityInstanceState::Executing {
            self.fault(reason.to_string());
        }
    }

    fn try_resume_bookmark(
        &mut self,
        bookmark: &Bookmark,
        value: Value,
        scope: BookmarkScope,
    ) -> BookmarkResumptionResult {
        if !self.state.started {
            return BookmarkResumptionResult::NotReady;
        }
        match &self.state.waiting {
            Some(waiting) if &waiting.bookmark == bookmark && waiting.scope == scope => {
                self.state.variables.insert(bookmark.name().to_string(), value);
                self.state.waiting = None;
                BookmarkResumptionResult::Success
            }
            _ => BookmarkResumptionResult::NotFound,
        }
    }

    fn bookmarks(&self, scope: Option<BookmarkScope>) -> Vec<BookmarkInfo> {
        self.state
            .waiting
            .iter()
            .filter(|waiting| scope.is_none_or(|scope| scope == waiting.scope))
            .map(|waiting| BookmarkInfo {
                bookmark: waiting.bookmark.clone(),
                scope: waiting.scope,
                owner_display_name: self.tree.display_name(waiting.owner).to_string(),
            })
            .collect()
    }

    fn mappable_variables(&self) -> BTreeMap<String, Value> {
        self.state.variables.clone()
    }

    fn is_persistable(&self) -> bool {
        self.aborted.is_none()
    }

    fn prepare_for_serialization(&mut self) -> EngineResult<Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn abort(&mut self, reason: &str) {
        self.aborted = Some(reason.to_string());
        self.running = false;
    }

    fn dispose(&mut self) {
        self.state.pending.clear();
        self.state.waiting = None;
    }

    fn fault_reason(&self) -> Option<String> {
        self.state.fault.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::runtime::activity::{ActivityNode, RuntimeArgument, ValueType};
    use crate::runtime::types::{TypeRegistry, builtin};

    // Root { Write("before"), Wait("approve"), Write(var approve) }
    fn waiting_tree() -> Arc<ActivityTree> {
        let types = Arc::new(TypeRegistry::with_builtins());
        let write = types.key(builtin::WRITE_LINE).unwrap();
        let mut builder = ActivityTree::builder(types.clone());
        let root = builder.activity(builtin::SEQUENCE, "Root").unwrap();
        let before = builder.add(
            ActivityNode::new("Before", write)
                .with_kind(ActivityKind::WriteLine)
                .with_argument(RuntimeArgument::input("Text", ValueType::String)),
        );
        let text = builder.add(
            ActivityNode::new("Text", types.key(builtin::CODE_ACTIVITY).unwrap())
                .with_kind(ActivityKind::Expression { value: json!("before") }),
        );
        builder.bind(before, "Text", text).unwrap();
        let wait = builder.add(
            ActivityNode::new("Wait", types.key(builtin::WAIT_FOR_BOOKMARK).unwrap()).with_kind(
                ActivityKind::WaitForBookmark {
                    bookmark: "approve".into(),
                },
            ),
        );
        let after = builder.add(
            ActivityNode::new("After", write)
                .with_kind(ActivityKind::WriteLine)
                .with_argument(RuntimeArgument::input("approve", ValueType::Any)),
        );
        for child in [before, wait, after] {
            builder.child(root, child).unwrap();
        }
        Arc::new(builder.build(root).unwrap())
    }

    #[test]
    fn test_run_wait_resume_complete() {
        let mut engine = SequentialEngine::start(waiting_tree(), BTreeMap::new()).unwrap();
        assert!(!engine.is_idle());
        assert_eq!(
            engine.try_resume_bookmark(&Bookmark::new("approve"), json!(true), BookmarkScope::Default),
            BookmarkResumptionResult::NotReady
        );

        engine.run().unwrap();
        assert!(engine.is_idle());
        assert_eq!(engine.state(), ActivityInstanceState::Executing);
        assert_eq!(engine.output(), ["before"]);
        assert_eq!(engine.bookmarks(None).len(), 1);

        assert_eq!(
            engine.try_resume_bookmark(&Bookmark::new("other"), json!(1), BookmarkScope::Default),
            BookmarkResumptionResult::NotFound
        );
        assert_eq!(
            engine.try_resume_bookmark(&Bookmark::new("approve"), json!("yes"), BookmarkScope::Default),
            BookmarkResumptionResult::Success
        );
        assert!(!engine.is_idle());

        engine.run().unwrap();
        assert_eq!(engine.state(), ActivityInstanceState::Closed);
        assert_eq!(engine.output(), ["before", "yes"]);
    }

    #[test]
    fn test_serialization_round_trip_mid_run() {
        let tree = waiting_tree();
        let mut engine = SequentialEngine::start(tree.clone(), BTreeMap::new()).unwrap();
        engine.run().unwrap();
        let state = engine.prepare_for_serialization().unwrap();

        let mut restored = SequentialEngine::rehydrate(tree, state).unwrap();
        assert!(restored.is_idle());
        assert_eq!(
            restored.try_resume_bookmark(&Bookmark::new("approve"), json!("ok"), BookmarkScope::Default),
            BookmarkResumptionResult::Success
        );
        restored.run().unwrap();
        assert_eq!(restored.state(), ActivityInstanceState::Closed);
    }

    #[test]
    fn test_cancel_and_terminate() {
        let mut engine = SequentialEngine::start(waiting_tree(), BTreeMap::new()).unwrap();
        engine.run().unwrap();
        engine.cancel_root_activity();
        assert!(!engine.is_idle());
        engine.run().unwrap();
        assert_eq!(engine.state(), ActivityInstanceState::Canceled);

        let mut engine = SequentialEngine::start(waiting_tree(), BTreeMap::new()).unwrap();
        engine.terminate("stop");
        assert_eq!(engine.state(), ActivityInstanceState::Faulted);
        assert_eq!(engine.fault_reason().as_deref(), Some("stop"));
    }

    #[test]
    fn test_pause_stops_at_step_boundary() {
        let mut engine = SequentialEngine::start(waiting_tree(), BTreeMap::new()).unwrap();
        engine.pause_scheduler();
        engine.run().unwrap();
        assert!(engine.output().is_empty());
        assert!(!engine.is_idle());
        engine.run().unwrap();
        assert_eq!(engine.output(), ["before"]);
    }

    #[test]
    fn test_rehydrate_rejects_foreign_state() {
        let state = json!({
            "instance_state": "Executing",
            "pending": [99],
            "waiting": null,
            "variables": {},
            "output": [],
            "started": true,
            "cancel_requested": false,
            "fault": null
        });
        assert!(matches!(
            SequentialEngine::rehydrate(waiting_tree(), state),
            Err(EngineError::InvalidState(_))
        ));
    }
}
