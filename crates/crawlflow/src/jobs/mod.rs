pub mod backend;
pub mod maintenance;
pub mod memory;
pub mod model;
pub mod producer;
pub mod recorder;
pub mod registry;
pub mod repeat;
pub mod repo;
pub mod runner;
pub mod worker;

pub use backend::QueueBackend;
pub use maintenance::{cutoff_days, QueueMaintenance};
pub use memory::MemoryQueue;
pub use model::{
    EnqueueOutcome, Job, JobOptions, JobStatus, LeaseRequest, NewJob, QueueCounts,
    RateLimiterConfig, Retention, WorkerPoolConfig,
};
pub use producer::{BulkJob, QueueProducer};
pub use recorder::{FailedJobSnapshot, FailureRecorder};
pub use registry::{boxed, BoxFuture, HandlerOptions, HandlerRegistry};
pub use repeat::{Cadence, RepeatScheduler, RepeatSpec};
pub use repo::PgQueue;
pub use runner::{JobRunner, RunOutcome};
pub use worker::{JobFailure, QueueListener, WorkerPool};
