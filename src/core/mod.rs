pub mod cache;
pub mod chunker;
pub mod comparator;
pub mod conflict;
pub mod engine;
pub mod ignore;
pub mod options;
pub mod planner;
pub mod progress;
pub mod scanner;
pub mod sync_state;
pub mod task_store;
pub mod transfer;

pub use cache::ListingCache;
pub use chunker::{chunk_boundaries, chunk_stream, Chunk, ChunkerParams};
pub use comparator::CompareEngine;
pub use conflict::ConflictResolver;
pub use engine::{SyncEngine, SyncReport};
pub use ignore::IgnoreRules;
pub use options::{CompareMethod, ConflictResolution, HashAlgorithm, SyncMode, SyncOptions};
pub use planner::{ActionKind, ChangePlanner, Direction, Plan, PlanSummary, SkipReason, SyncAction};
pub use progress::{ProgressReporter, ProgressUpdate, Statistics, StatisticsSnapshot};
pub use scanner::{ScanConfig, ScanResult, TreeScanner};
pub use sync_state::{SyncPoint, SyncStateStore};
pub use task_store::TaskStore;
pub use transfer::{
    ExecutorConfig, FetchRequest, SourceRef, TaskStatus, TransferExecutor, TransferSettings, TransferTask,
};
