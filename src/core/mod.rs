pub mod comparator;
pub mod engine;
pub mod entry;
pub mod filter;
pub mod scanner;
pub mod signature;
pub mod transfer;

pub use comparator::{CompareConfig, CompareStats, Comparison, ComparisonStatus, FileComparator};
pub use engine::{CompareOutcome, SyncEngine};
pub use entry::{Entry, EntryKind, ScanResult};
pub use filter::{FilterEngine, FilterKind, FilterRule};
pub use scanner::{LocalScanner, RemoteScanner};
pub use signature::calculate_hash;
pub use transfer::{
    Operation, Outcome, PerItemResult, Side, SyncAction, SyncExecutor, SyncReport,
};
