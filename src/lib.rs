// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

// Engine subsystems
pub mod definition; // Process definitions, catalog, call-activity resolution
pub mod engine; // Change-state command façade
pub mod history; // Lifecycle events and asynchronous history pipeline
pub mod links; // Entity-link hierarchy records
pub mod migration; // Move requests, planning, execution
pub mod tree; // Execution-tree data model and store

// Re-exports for convenience
pub use core::config::EngineConfig;
pub use core::errors::{ProcessionError, Result};
pub use engine::ProcessEngine;

pub use definition::{
    ActivityKind, ActivityNode, CallActivityResolver, CalledElement, DefinitionBuilder,
    DefinitionCatalog, EvalexprEvaluator, ExpressionEvaluator, ProcessDefinition,
};
pub use history::{
    BufferingHistorySink, EventEnvelope, HistoricActivity, HistoricInstance, HistoryNotifier,
    HistorySink, HistoryStore, HistoryWorker, LifecycleEvent, LoggingHistorySink,
};
pub use links::{
    EntityLink, HierarchyLinkSynchronizer, HierarchyType, LinkTable, LinkType, ScopeType,
};
pub use migration::{
    AppliedMigration, MigrationExecutor, MigrationPlan, MigrationPlanner, MigrationRequest,
    MigrationRequestBuilder, MigrationResult, MoveSpec, PlannedMove, PlannedMoveKind,
};
pub use tree::{
    DeletedSubtree, Execution, ExecutionTreeStore, InstanceState, ProcessInstance,
    StartedInstance, TaskEntity, TerminatedHierarchy, TreeSnapshot,
};
