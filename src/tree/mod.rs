pub mod model;
pub mod store;

// Re-export all the key structs and functions
pub use model::{Execution, InstanceState, ProcessInstance, TaskEntity};
pub use store::{
    DeletedSubtree, ExecutionTreeStore, StartedInstance, TerminatedHierarchy, TreeSnapshot,
};
