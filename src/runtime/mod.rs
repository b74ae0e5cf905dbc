//! Runtime orchestrator and public API
//!
//! This module provides the `Runtime` struct that ties a type registry, an
//! instance store and the validation defaults together, and re-exports the
//! pieces hosts embed directly: activity trees, validation services and the
//! workflow instance controller.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

// Submodules
pub mod activity;
pub mod bookmark;
pub mod definition;
pub mod engine;
pub mod error;
pub mod extension;
pub mod instance;
pub mod metadata;
pub mod storage;
pub mod tracking;
pub mod types;
pub mod validation;

/// Validation defaults applied by [`Runtime::validate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Validate only the root activity
    pub single_level: bool,
    /// Skip the root's own configuration checks
    pub skip_validating_root_configuration: bool,
    /// Report only errors from additional constraints
    pub only_use_additional_constraints: bool,
    /// Commit metadata onto the tree while validating
    pub prepare_for_runtime: bool,
}

impl ValidationConfig {
    /// Settings with these flags and no additional constraints
    pub fn to_settings(&self) -> ValidationSettings {
        ValidationSettings {
            single_level: self.single_level,
            skip_validating_root_configuration: self.skip_validating_root_configuration,
            only_use_additional_constraints: self.only_use_additional_constraints,
            prepare_for_runtime: self.prepare_for_runtime,
            ..Default::default()
        }
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for the instance store (default: .weft/)
    pub root: PathBuf,

    /// Attach a logging tracking participant to every instance
    pub tracking_enabled: bool,

    /// Validation defaults
    pub validation: ValidationConfig,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".weft"),
            tracking_enabled: true,
            validation: ValidationConfig::default(),
            debug: false,
        }
    }
}

use activity::ActivityTree;
use engine::SequentialEngine;
use error::Result;
use instance::WorkflowInstance;
use storage::InstanceStore;
use tracking::LogTrackingParticipant;
use types::TypeRegistry;
use validation::{ValidationResults, ValidationSettings};

/// The runtime orchestrator
///
/// Owns the process-wide state hosts would otherwise reach for globally: the
/// type registry definitions are built against and the instance store.
pub struct Runtime {
    config: RuntimeConfig,
    types: Arc<TypeRegistry>,
    store: Arc<InstanceStore>,
}

impl Runtime {
    /// Create a runtime with the built-in activity types
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_types(config, TypeRegistry::with_builtins())
    }

    /// Create a runtime with a custom type registry
    pub fn with_types(config: RuntimeConfig, types: TypeRegistry) -> Result<Self> {
        if config.root.as_os_str().is_empty() {
            return Err(RuntimeError::Config("store root must not be empty".into()));
        }
        let store = InstanceStore::open(config.root.clone())?;
        info!("runtime store at {:?}", store.root());
        Ok(Self {
            config,
            types: Arc::new(types),
            store: Arc::new(store),
        })
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Type registry
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Instance store
    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    /// Validate a definition with the configured defaults
    pub fn validate(&self, tree: &ActivityTree) -> Result<ValidationResults> {
        self.validate_with(tree, &self.config.validation.to_settings())
    }

    /// Validate a definition with explicit settings
    pub fn validate_with(&self, tree: &ActivityTree, settings: &ValidationSettings) -> Result<ValidationResults> {
        validation::validate_with_settings(tree, settings)
    }

    /// New, uninitialized instance of a definition, bound to the store
    pub fn create_instance(&self, definition: Arc<ActivityTree>) -> WorkflowInstance<SequentialEngine> {
        self.configure(WorkflowInstance::new(definition))
    }

    /// Rehydrate a persisted instance
    pub fn load_instance(&self, id: Uuid, definition: Arc<ActivityTree>) -> Result<WorkflowInstance<SequentialEngine>> {
        let snapshot = self.store.load(id)?;
        let instance = self.configure(WorkflowInstance::with_id(id, definition));
        instance.initialize_from_snapshot(snapshot)?;
        Ok(instance)
    }

    fn configure(&self, instance: WorkflowInstance<SequentialEngine>) -> WorkflowInstance<SequentialEngine> {
        let instance = instance.with_store(self.store.clone());
        if self.config.tracking_enabled {
            instance.with_participant(Arc::new(LogTrackingParticipant))
        } else {
            instance
        }
    }
}

// Re-export commonly used types
pub use activity::{ActivityNode, ActivityRef, ActivityTreeBuilder, NodeIndex};
pub use bookmark::{Bookmark, BookmarkResumptionResult, BookmarkScope};
pub use error::RuntimeError;
pub use instance::{AbortReason, InstanceSnapshot, WorkflowInstanceState};
