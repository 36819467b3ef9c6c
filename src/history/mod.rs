pub mod events;
pub mod notifier;

// Re-export all the key structs and functions
pub use events::{
    BufferingHistorySink, EventEnvelope, HistorySink, LifecycleEvent, LoggingHistorySink,
};
pub use notifier::{
    HistoricActivity, HistoricInstance, HistoryNotifier, HistoryStore, HistoryWorker,
};
