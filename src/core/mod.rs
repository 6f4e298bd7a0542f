pub mod conflict;
pub mod decision;
pub mod delta;
pub mod dispatch;
pub mod engine;
pub mod filter;
pub mod fingerprint;
pub mod path;
pub mod plan;
pub mod reconciler;
pub mod safety;
pub mod scanner;
pub mod state;
pub mod transfer;

pub use conflict::{ConflictInfo, ConflictLog, ConflictRecord, ConflictStrategy};
pub use decision::{Action, Decision, DecisionKind, Side};
pub use delta::{DeltaProcessor, RemoteChanges, RemoteEntry};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use engine::{PassMode, SyncEngine, SyncReport};
pub use filter::FilterRules;
pub use plan::Plan;
pub use reconciler::{reconcile, ReconcileInput};
pub use safety::{BlockedCategory, SafetyChecker, SafetyConfig, Violation};
pub use scanner::{LocalEntry, LocalScan, LocalScanner};
pub use state::{ItemRecord, StateStore, SyncedSnapshot, Tombstone};
pub use transfer::{DriveTransfer, RetryPolicy, Transfer};
