//! Workflow instance controller tests
//!
//! Covers the behaviour hosts observe across threads and processes: the
//! fail-fast operation lock, persistence through the instance store, and
//! abort propagation to extensions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use once_cell::sync::Lazy;
use serde_json::{Value, json};
use tempfile::TempDir;
use weft::runtime::activity::{ActivityKind, ActivityNode, ActivityTree, RuntimeArgument, ValueType};
use weft::runtime::bookmark::BookmarkInfo;
use weft::runtime::engine::{ActivityInstanceState, ExecutionEngine, SequentialEngine};
use weft::runtime::error::{EngineResult, OperationError, RuntimeError};
use weft::runtime::extension::WorkflowExtension;
use weft::runtime::instance::WorkflowInstance;
use weft::runtime::storage::InstanceStore;
use weft::runtime::tracking::{InstanceLifecycle, MemoryTrackingParticipant};
use weft::runtime::types::{TypeRegistry, builtin};
use weft::runtime::validation::{ValidationSettings, validate_with_settings};
use weft::runtime::{Bookmark, BookmarkResumptionResult, BookmarkScope, Runtime, RuntimeConfig, WorkflowInstanceState};

static ENTERED_RUN: Lazy<Barrier> = Lazy::new(|| Barrier::new(2));
static RELEASE_RUN: Lazy<Barrier> = Lazy::new(|| Barrier::new(2));
static DISPOSED: AtomicUsize = AtomicUsize::new(0);

/// Engine whose `run` parks until the test releases it
struct GatedEngine {
    done: bool,
}

impl ExecutionEngine for GatedEngine {
    fn start(_tree: Arc<ActivityTree>, _inputs: BTreeMap<String, Value>) -> EngineResult<Self> {
        Ok(Self { done: false })
    }

    fn rehydrate(_tree: Arc<ActivityTree>, _state: Value) -> EngineResult<Self> {
        Ok(Self { done: false })
    }

    fn is_idle(&self) -> bool {
        self.done
    }

    fn state(&self) -> ActivityInstanceState {
        if self.done {
            ActivityInstanceState::Closed
        } else {
            ActivityInstanceState::Executing
        }
    }

    fn is_running(&self) -> bool {
        false
    }

    fn run(&mut self) -> EngineResult<()> {
        ENTERED_RUN.wait();
        RELEASE_RUN.wait();
        self.done = true;
        Ok(())
    }

    fn pause_scheduler(&mut self) {}

    fn pause_when_persistable(&mut self) {}

    fn cancel_root_activity(&mut self) {}

    fn terminate(&mut self, _reason: &str) {}

    fn try_resume_bookmark(&mut self, _: &Bookmark, _: Value, _: BookmarkScope) -> BookmarkResumptionResult {
        BookmarkResumptionResult::NotFound
    }

    fn bookmarks(&self, _scope: Option<BookmarkScope>) -> Vec<BookmarkInfo> {
        Vec::new()
    }

    fn mappable_variables(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    fn is_persistable(&self) -> bool {
        true
    }

    fn prepare_for_serialization(&mut self) -> EngineResult<Value> {
        Ok(json!({ "done": self.done }))
    }

    fn abort(&mut self, _reason: &str) {}

    fn dispose(&mut self) {
        DISPOSED.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingExtension {
    cancelled: AtomicUsize,
}

impl WorkflowExtension for CountingExtension {
    fn name(&self) -> &str {
        "counting"
    }

    fn cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

fn approval_tree() -> Arc<ActivityTree> {
    let types = Arc::new(TypeRegistry::with_builtins());
    let mut builder = ActivityTree::builder(types.clone());
    let root = builder.activity(builtin::SEQUENCE, "Approval").unwrap();
    let wait = builder.add(
        ActivityNode::new("Wait", types.key(builtin::WAIT_FOR_BOOKMARK).unwrap()).with_kind(
            ActivityKind::WaitForBookmark {
                bookmark: "approve".into(),
            },
        ),
    );
    builder.child(root, wait).unwrap();
    Arc::new(builder.build(root).unwrap())
}

#[test]
fn test_concurrent_operations_fail_fast() {
    let instance: WorkflowInstance<GatedEngine> = WorkflowInstance::new(approval_tree());
    instance.initialize(None).unwrap();

    std::thread::scope(|scope| {
        let runner = scope.spawn(|| instance.run());

        ENTERED_RUN.wait();
        // the first caller holds the operation lock for the whole run
        let err = instance.run().unwrap_err();
        assert_eq!(err.as_operation(), Some(&OperationError::OperationInProgress));
        let err = instance.abort().unwrap_err();
        assert_eq!(err.as_operation(), Some(&OperationError::OperationInProgress));
        assert_eq!(instance.state(), WorkflowInstanceState::Runnable);
        RELEASE_RUN.wait();

        runner.join().unwrap().unwrap();
    });

    assert_eq!(instance.state(), WorkflowInstanceState::Complete);
}

#[test]
fn test_persist_and_resume_in_new_instance() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(InstanceStore::open(temp.path().join("store")).unwrap());
    let tree = approval_tree();

    let first_participant = MemoryTrackingParticipant::new();
    let first: WorkflowInstance<SequentialEngine> = WorkflowInstance::new(tree.clone())
        .with_store(store.clone())
        .with_participant(Arc::new(first_participant.clone()));
    first.initialize(None).unwrap();
    first.run().unwrap();
    assert_eq!(first.state(), WorkflowInstanceState::Idle);
    first.persist().unwrap();
    first.flush_tracking().unwrap();
    assert_eq!(
        first_participant.lifecycle(),
        vec![InstanceLifecycle::Started, InstanceLifecycle::Persisted]
    );
    assert_eq!(store.list().unwrap(), vec![first.id()]);

    let second_participant = MemoryTrackingParticipant::new();
    let second: WorkflowInstance<SequentialEngine> = WorkflowInstance::load(store.clone(), first.id(), tree)
        .unwrap()
        .with_participant(Arc::new(second_participant.clone()));
    assert_eq!(second.state(), WorkflowInstanceState::Idle);
    let bookmarks = second.bookmarks(None).unwrap();
    assert_eq!(bookmarks.len(), 1);
    assert_eq!(bookmarks[0].owner_display_name, "Wait");

    let result = second
        .schedule_bookmark_resumption(&Bookmark::new("approve"), json!("ok"), BookmarkScope::Default)
        .unwrap();
    assert_eq!(result, BookmarkResumptionResult::Success);
    second.run().unwrap();
    assert_eq!(second.state(), WorkflowInstanceState::Complete);
    assert_eq!(second.mapped_variables().unwrap().get("approve"), Some(&json!("ok")));

    second.flush_tracking().unwrap();
    assert_eq!(
        second_participant.lifecycle(),
        vec![InstanceLifecycle::Resumed, InstanceLifecycle::Closed]
    );
}

#[test]
fn test_snapshot_of_other_definition_rejected() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(InstanceStore::open(temp.path()).unwrap());

    let instance: WorkflowInstance<SequentialEngine> = WorkflowInstance::new(approval_tree()).with_store(store.clone());
    instance.initialize(None).unwrap();
    instance.run().unwrap();
    instance.persist().unwrap();

    let mut builder = ActivityTree::builder(Arc::new(TypeRegistry::with_builtins()));
    let root = builder.activity(builtin::SEQUENCE, "Something else").unwrap();
    let other = Arc::new(builder.build(root).unwrap());

    let err = WorkflowInstance::<SequentialEngine>::load(store, instance.id(), other).unwrap_err();
    assert!(matches!(err, RuntimeError::Engine(_)));
}

#[test]
fn test_abort_cancels_extensions_once() {
    let extension = Arc::new(CountingExtension::default());
    let instance: WorkflowInstance<SequentialEngine> = WorkflowInstance::new(approval_tree());
    instance.add_extension(extension.clone());
    instance.initialize(None).unwrap();
    instance.run().unwrap();

    instance.abort_with("operator request").unwrap();
    instance.abort().unwrap();
    assert_eq!(extension.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(instance.state(), WorkflowInstanceState::Aborted);
    assert_eq!(instance.abort_reason().unwrap().message, "operator request");
}

#[test]
fn test_abort_disposes_engine_once() {
    let instance: WorkflowInstance<GatedEngine> = WorkflowInstance::new(approval_tree());
    instance.initialize(None).unwrap();
    instance.abort().unwrap();
    instance.abort().unwrap();
    assert_eq!(DISPOSED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_runtime_validation_still_blocks_initialize() {
    let types = Arc::new(TypeRegistry::with_builtins());
    let mut builder = ActivityTree::builder(types.clone());
    let root = builder.activity(builtin::SEQUENCE, "Root").unwrap();
    let y = builder.add(
        ActivityNode::new("Y", types.key(builtin::WRITE_LINE).unwrap())
            .with_kind(ActivityKind::WriteLine)
            .with_argument(RuntimeArgument::input("Text", ValueType::String).required()),
    );
    builder.child(root, y).unwrap();
    let tree = Arc::new(builder.build(root).unwrap());

    let settings = ValidationSettings {
        prepare_for_runtime: true,
        ..Default::default()
    };
    let results = validate_with_settings(&tree, &settings).unwrap();
    assert_eq!(results.errors().len(), 1);

    let instance: WorkflowInstance<SequentialEngine> = WorkflowInstance::new(tree);
    match instance.initialize(None) {
        Err(RuntimeError::InvalidWorkflow(err)) => {
            assert!(err.to_string().contains("'Y': Value for a required activity argument 'Text' was not supplied."));
        }
        other => panic!("expected an invalid workflow, got {other:?}"),
    }
    assert!(matches!(
        instance.run().unwrap_err().as_operation(),
        Some(OperationError::NotInitialized)
    ));
}

#[test]
fn test_runtime_runs_document_end_to_end() {
    let temp = TempDir::new().unwrap();
    let runtime = Runtime::new(RuntimeConfig {
        root: temp.path().to_path_buf(),
        tracking_enabled: false,
        ..Default::default()
    })
    .unwrap();

    let document = weft::runtime::definition::TreeDocument::from_json(
        r#"{
            "root": "Main",
            "activities": [
                { "name": "Main", "type": "Sequence", "children": ["Wait"],
                  "arguments": [{ "name": "Customer", "direction": "In", "value_type": "string", "is_required": true }] },
                { "name": "Wait", "type": "WaitForBookmark",
                  "behavior": { "kind": "wait_for_bookmark", "bookmark": "go" } }
            ]
        }"#,
    )
    .unwrap();
    let tree = Arc::new(document.into_tree(runtime.types()).unwrap());
    // definitions are validated without inputs; the instance checks them
    let results = runtime.validate(&tree).unwrap();
    assert_eq!(results.errors().len(), 1);
    assert_eq!(results.errors()[0].property_name.as_deref(), Some("Customer"));

    let instance = runtime.create_instance(tree.clone());
    let err = instance.initialize(None).unwrap_err();
    assert!(matches!(err, RuntimeError::Argument(ref arg) if arg.param == "program"));

    let inputs = BTreeMap::from([("Customer".to_string(), json!("acme"))]);
    let instance = runtime.create_instance(tree.clone());
    instance.initialize(Some(inputs)).unwrap();
    instance.run().unwrap();
    instance.persist().unwrap();

    let resumed = runtime.load_instance(instance.id(), tree).unwrap();
    assert_eq!(resumed.state(), WorkflowInstanceState::Idle);
    assert_eq!(resumed.mapped_variables().unwrap().get("Customer"), Some(&json!("acme")));
}
