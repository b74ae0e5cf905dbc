//! Workflow instance controller
//!
//! Every host operation on a [`WorkflowInstance`] takes the instance's
//! operation lock with a non-blocking test-and-set. A caller that loses the
//! race gets [`OperationError::OperationInProgress`] at once; nothing queues.
//! Read-only and mutating operations share the same lock.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::activity::ActivityTree;
use super::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult, BookmarkScope};
use super::engine::{ActivityInstanceState, ExecutionEngine};
use super::error::{EngineError, InvalidWorkflowError, OperationError, Result};
use super::extension::{ExtensionManager, WorkflowExtension};
use super::metadata::{CachingOptions, MetadataCache};
use super::storage::InstanceStore;
use super::tracking::{InstanceLifecycle, TrackingParticipant, TrackingProvider, TrackingRecord};
use super::validation::{ExceptionReason, generate_exception_string, validate_root_inputs};

/// Externally observable state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowInstanceState {
    /// Suspended until a bookmark is resumed
    Idle,
    /// Has work to do
    Runnable,
    /// Finished; terminal
    Complete,
    /// Aborted; terminal, overrides every other state
    Aborted,
}

/// Why an instance was aborted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason {
    /// Primary reason
    pub message: String,
    /// Underlying cause, if any
    pub inner: Option<String>,
}

impl AbortReason {
    /// Reason without an underlying cause
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            inner: None,
        }
    }

    /// Attach an underlying cause
    pub fn with_inner(mut self, inner: impl Into<String>) -> Self {
        self.inner = Some(inner.into());
        self
    }

    /// Reason taken from an error and its source
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        Self {
            message: err.to_string(),
            inner: err.source().map(|source| source.to_string()),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => write!(f, "{} ({})", self.message, inner),
            None => f.write_str(&self.message),
        }
    }
}

impl From<&str> for AbortReason {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for AbortReason {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Persisted form of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Instance id
    pub instance_id: Uuid,
    /// Fingerprint of the definition the instance runs
    pub definition_hash: String,
    /// Opaque engine state
    pub engine_state: Value,
    /// Whether a `Started` record was ever emitted for the instance
    pub has_tracked_started: bool,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// When the snapshot was taken
    pub persisted_at: DateTime<Utc>,
}

struct OperationGuard<'a> {
    lock: &'a AtomicBool,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Mutate,
}

/// A running workflow, driven by the host through its operation set
pub struct WorkflowInstance<E: ExecutionEngine> {
    id: Uuid,
    definition: Arc<ActivityTree>,
    engine: Mutex<Option<E>>,
    operation_lock: AtomicBool,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<AbortReason>>,
    has_tracked_started: AtomicBool,
    has_tracked_resumed: AtomicBool,
    has_tracked_completion: AtomicBool,
    tracking: TrackingProvider,
    extensions: ExtensionManager,
    store: Option<Arc<InstanceStore>>,
    created_at: DateTime<Utc>,
}

impl<E: ExecutionEngine> WorkflowInstance<E> {
    /// New, uninitialized instance of a definition
    pub fn new(definition: Arc<ActivityTree>) -> Self {
        Self::with_id(Uuid::new_v4(), definition)
    }

    /// New, uninitialized instance with a known id
    pub fn with_id(id: Uuid, definition: Arc<ActivityTree>) -> Self {
        Self {
            id,
            definition,
            engine: Mutex::new(None),
            operation_lock: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            has_tracked_started: AtomicBool::new(false),
            has_tracked_resumed: AtomicBool::new(false),
            has_tracked_completion: AtomicBool::new(false),
            tracking: TrackingProvider::new(),
            extensions: ExtensionManager::new(),
            store: None,
            created_at: Utc::now(),
        }
    }

    /// Load a persisted instance from a store and rehydrate it
    pub fn load(store: Arc<InstanceStore>, id: Uuid, definition: Arc<ActivityTree>) -> Result<Self> {
        let snapshot = store.load(id)?;
        let instance = Self::with_id(id, definition).with_store(store);
        instance.initialize_from_snapshot(snapshot)?;
        Ok(instance)
    }

    /// Attach a tracking participant; enables tracking
    pub fn with_participant(mut self, participant: Arc<dyn TrackingParticipant>) -> Self {
        self.tracking.add_participant(participant);
        self
    }

    /// Attach the store used by [`persist`](Self::persist)
    pub fn with_store(mut self, store: Arc<InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a host extension
    pub fn add_extension(&self, extension: Arc<dyn WorkflowExtension>) {
        self.extensions.add(extension);
    }

    /// Instance id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Definition the instance runs
    pub fn definition(&self) -> &Arc<ActivityTree> {
        &self.definition
    }

    /// Current state
    ///
    /// While another operation is driving the engine the instance reports
    /// [`WorkflowInstanceState::Runnable`].
    pub fn state(&self) -> WorkflowInstanceState {
        if self.aborted.load(Ordering::Acquire) {
            return WorkflowInstanceState::Aborted;
        }
        match self.engine.try_lock() {
            Some(slot) => slot
                .as_ref()
                .map_or(WorkflowInstanceState::Runnable, Self::compute_state),
            None => WorkflowInstanceState::Runnable,
        }
    }

    /// First abort reason, kept after the instance stops accepting operations
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason.lock().clone()
    }

    /// Prepare a new run
    ///
    /// Caches the definition's metadata for runtime (once per definition),
    /// rejects structurally invalid definitions, checks the root inputs and
    /// starts the engine.
    pub fn initialize(&self, inputs: Option<BTreeMap<String, Value>>) -> Result<()> {
        let _guard = self.begin_operation()?;
        let mut slot = self.engine.lock();
        if slot.is_some() {
            return Err(OperationError::AlreadyInitialized.into());
        }
        self.throw_if_aborted()?;

        self.prepare_definition()?;
        validate_root_inputs(&self.definition, inputs.as_ref())?;

        *slot = Some(E::start(self.definition.clone(), inputs.unwrap_or_default())?);
        info!("initialized instance {} of '{}'", self.id, self.root_name());
        Ok(())
    }

    /// Rehydrate from a persisted snapshot
    pub fn initialize_from_snapshot(&self, snapshot: InstanceSnapshot) -> Result<()> {
        let _guard = self.begin_operation()?;
        let mut slot = self.engine.lock();
        if slot.is_some() {
            return Err(OperationError::AlreadyInitialized.into());
        }
        self.throw_if_aborted()?;

        if snapshot.instance_id != self.id {
            return Err(EngineError::InstanceMismatch {
                expected: self.id,
                found: snapshot.instance_id,
            }
            .into());
        }
        let fingerprint = self.definition.fingerprint();
        if snapshot.definition_hash != fingerprint {
            return Err(EngineError::DefinitionMismatch {
                expected: snapshot.definition_hash,
                found: fingerprint,
            }
            .into());
        }

        self.prepare_definition()?;
        *slot = Some(E::rehydrate(self.definition.clone(), snapshot.engine_state)?);
        self.has_tracked_started
            .store(snapshot.has_tracked_started, Ordering::Release);
        info!("rehydrated instance {} of '{}'", self.id, self.root_name());
        Ok(())
    }

    /// Run until idle, complete or paused
    pub fn run(&self) -> Result<()> {
        self.operate(Access::Mutate, |engine| {
            self.track_resumed();
            engine.run()?;
            self.track_completion(engine, false);
            debug!("instance {} ran to {:?}", self.id, Self::compute_state(engine));
            Ok(())
        })
    }

    /// Ask the engine to stop at the next step boundary
    pub fn request_pause(&self) -> Result<()> {
        self.operate(Access::Mutate, |engine| {
            engine.pause_scheduler();
            Ok(())
        })
    }

    /// Ask the engine to stop at the next persistable point
    ///
    /// Requires an instance store.
    pub fn pause_when_persistable(&self) -> Result<()> {
        self.operate(Access::Mutate, |engine| {
            if self.store.is_none() {
                return Err(OperationError::NotPersistable.into());
            }
            engine.pause_when_persistable();
            Ok(())
        })
    }

    /// Cancel the root activity; takes effect on the next run
    pub fn schedule_cancel(&self) -> Result<()> {
        self.operate(Access::Mutate, |engine| {
            engine.cancel_root_activity();
            Ok(())
        })
    }

    /// Fault the instance cleanly with `reason`
    pub fn terminate(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.operate(Access::Mutate, |engine| {
            info!("terminating instance {}: {}", self.id, reason);
            engine.terminate(&reason);
            self.track_completion(engine, true);
            Ok(())
        })
    }

    /// Resume a bookmark; the engine must be idle
    ///
    /// A completed instance is idle too and reports
    /// [`BookmarkResumptionResult::NotFound`].
    pub fn schedule_bookmark_resumption(
        &self,
        bookmark: &Bookmark,
        value: Value,
        scope: BookmarkScope,
    ) -> Result<BookmarkResumptionResult> {
        self.operate(Access::Mutate, |engine| {
            if !engine.is_idle() {
                return Err(OperationError::NotIdle.into());
            }
            let result = engine.try_resume_bookmark(bookmark, value, scope);
            if result == BookmarkResumptionResult::Success {
                self.track_resumed();
            }
            debug!("resuming bookmark '{}' on {}: {:?}", bookmark, self.id, result);
            Ok(result)
        })
    }

    /// Abort with a generic reason
    pub fn abort(&self) -> Result<()> {
        self.abort_with(AbortReason::new("The workflow instance was aborted by the host."))
    }

    /// Force-stop the instance
    ///
    /// Only the first abort has effects; later calls succeed and keep the
    /// first reason.
    pub fn abort_with(&self, reason: impl Into<AbortReason>) -> Result<()> {
        let reason = reason.into();
        let _guard = self.begin_operation()?;
        if self.aborted.load(Ordering::Acquire) {
            return Ok(());
        }

        {
            let mut stored = self.abort_reason.lock();
            if stored.is_none() {
                *stored = Some(reason.clone());
            }
        }
        self.aborted.store(true, Ordering::Release);
        warn!("aborting instance {}: {}", self.id, reason);

        if let Some(engine) = self.engine.lock().as_mut() {
            engine.abort(&reason.to_string());
            engine.dispose();
        }
        self.extensions.cancel_all();
        self.tracking.add_record(TrackingRecord::instance(
            self.id,
            InstanceLifecycle::Aborted,
            Some(reason.to_string()),
        ));
        Ok(())
    }

    /// Bookmarks the instance is waiting on
    pub fn bookmarks(&self, scope: Option<BookmarkScope>) -> Result<Vec<BookmarkInfo>> {
        self.operate(Access::Read, |engine| Ok(engine.bookmarks(scope)))
    }

    /// Variables the engine exposes to the host
    pub fn mapped_variables(&self) -> Result<BTreeMap<String, Value>> {
        self.operate(Access::Read, |engine| Ok(engine.mappable_variables()))
    }

    /// Serializable snapshot of the instance
    pub fn prepare_for_serialization(&self) -> Result<InstanceSnapshot> {
        self.operate(Access::Mutate, |engine| self.snapshot(engine))
    }

    /// Save a snapshot to the attached store
    pub fn persist(&self) -> Result<()> {
        let store = self.store.clone().ok_or(OperationError::NotPersistable)?;
        self.operate(Access::Mutate, |engine| {
            let snapshot = self.snapshot(engine)?;
            store.save(&snapshot)?;
            self.tracking
                .add_record(TrackingRecord::instance(self.id, InstanceLifecycle::Persisted, None));
            Ok(())
        })
    }

    /// Buffer a host tracking record
    pub fn track(&self, record: TrackingRecord) -> Result<()> {
        let _guard = self.begin_operation()?;
        self.tracking.add_record(record);
        Ok(())
    }

    /// Deliver buffered tracking records to the participants
    pub fn flush_tracking(&self) -> Result<usize> {
        let _guard = self.begin_operation()?;
        Ok(self.tracking.flush())
    }

    fn begin_operation(&self) -> Result<OperationGuard<'_>> {
        if self
            .operation_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(OperationError::OperationInProgress.into());
        }
        Ok(OperationGuard {
            lock: &self.operation_lock,
        })
    }

    fn operate<R>(&self, access: Access, op: impl FnOnce(&mut E) -> Result<R>) -> Result<R> {
        let _guard = self.begin_operation()?;
        let mut slot = self.engine.lock();
        let engine = slot.as_mut().ok_or(OperationError::NotInitialized)?;
        if access == Access::Mutate && engine.is_running() {
            return Err(OperationError::RuntimeRunning.into());
        }
        self.throw_if_aborted()?;
        op(engine)
    }

    fn throw_if_aborted(&self) -> Result<()> {
        if !self.aborted.load(Ordering::Acquire) {
            return Ok(());
        }
        let reason = self
            .abort_reason
            .lock()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        Err(OperationError::Aborted(reason).into())
    }

    fn compute_state(engine: &E) -> WorkflowInstanceState {
        if !engine.is_idle() {
            WorkflowInstanceState::Runnable
        } else if engine.state() == ActivityInstanceState::Executing {
            WorkflowInstanceState::Idle
        } else {
            WorkflowInstanceState::Complete
        }
    }

    fn prepare_definition(&self) -> Result<()> {
        if self.definition.metadata().is_none() {
            let cache = MetadataCache::new(&self.definition);
            let mut errors = Vec::new();
            cache.cache_root(CachingOptions::runtime(), &mut |_, _| Ok(()), &mut errors)?;
            if let Some(message) =
                generate_exception_string(&errors, ExceptionReason::ErrorsEncounteredWhileProcessingTree)
            {
                return Err(InvalidWorkflowError::new(message).into());
            }
            self.definition.commit_metadata(cache.into_metadata());
        }
        self.definition.associate_with_instance();
        Ok(())
    }

    fn snapshot(&self, engine: &mut E) -> Result<InstanceSnapshot> {
        if !engine.is_persistable() {
            return Err(OperationError::NotPersistable.into());
        }
        Ok(InstanceSnapshot {
            instance_id: self.id,
            definition_hash: self.definition.fingerprint(),
            engine_state: engine.prepare_for_serialization()?,
            has_tracked_started: self.has_tracked_started.load(Ordering::Acquire),
            created_at: self.created_at,
            persisted_at: Utc::now(),
        })
    }

    // Once per in-memory instance, not once per Idle -> Runnable transition.
    fn track_resumed(&self) {
        if self.has_tracked_resumed.swap(true, Ordering::AcqRel) {
            return;
        }
        let lifecycle = if self.has_tracked_started.swap(true, Ordering::AcqRel) {
            InstanceLifecycle::Resumed
        } else {
            InstanceLifecycle::Started
        };
        self.tracking
            .add_record(TrackingRecord::instance(self.id, lifecycle, None));
    }

    fn track_completion(&self, engine: &E, terminated: bool) {
        let lifecycle = match engine.state() {
            ActivityInstanceState::Executing => return,
            ActivityInstanceState::Closed => InstanceLifecycle::Closed,
            ActivityInstanceState::Canceled => InstanceLifecycle::Canceled,
            ActivityInstanceState::Faulted if terminated => InstanceLifecycle::Terminated,
            ActivityInstanceState::Faulted => InstanceLifecycle::Faulted,
        };
        if self.has_tracked_completion.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("instance {} completed: {}", self.id, lifecycle);
        self.tracking
            .add_record(TrackingRecord::instance(self.id, lifecycle, engine.fault_reason()));
    }

    fn root_name(&self) -> &str {
        self.definition.display_name(self.definition.root())
    }
}

impl<E: ExecutionEngine> fmt::Debug for WorkflowInstance<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("tracking", &self.tracking)
            .field("extensions", &self.extensions)
            .finish()
    }
}
