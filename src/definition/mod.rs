pub mod catalog;
pub mod model;
pub mod resolver;

// Re-export all the key structs and functions
pub use catalog::DefinitionCatalog;
pub use model::{
    ActivityKind, ActivityNode, CalledElement, DefinitionBuilder, ProcessDefinition,
};
pub use resolver::{CallActivityResolver, EvalexprEvaluator, ExpressionEvaluator};
