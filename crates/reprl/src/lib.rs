#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod coverage;
pub mod execution;
pub mod target;
pub mod worker;

pub use coverage::{CoverageError, CoverageMap, MAX_EDGES, SHM_SIZE};
pub use execution::{
    Execution, MAX_DATA_SIZE, MAX_TIMEOUT, ReprlError, ReprlOptions, ReprlSession,
    status::ExecutionStatus,
};
pub use target::{ConfigError, JsEngine, TargetConfig};
pub use worker::{MAX_WORKERS, Worker, WorkerError, WorkerPool};
