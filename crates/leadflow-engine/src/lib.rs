pub mod condition;
pub mod coordinator;
pub mod cursor;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod journal;
pub mod lanes;
pub mod runner;
pub mod scheduler;

pub use condition::ConditionEvaluator;
pub use coordinator::{StageTransitionCoordinator, Transition};
pub use dispatch::RetryingDispatcher;
pub use engine::{FlowEngine, RecoveryReport};
pub use graph::{ensure_valid, validate_sequence, Next, StepGraph, ValidationIssue};
pub use runner::FlowRunner;
pub use scheduler::Scheduler;
