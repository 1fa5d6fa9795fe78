//! Event ingestion: push normalization, bounded queues and consumer workers

pub mod dispatcher;
pub mod queue;
pub mod worker;

pub use dispatcher::EventDispatcher;
pub use queue::{EventQueue, EventQueues, QueueStats};
pub use worker::{ConsumerWorkers, WorkerStats};
