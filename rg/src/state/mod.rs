//! Durable on-disk state: `state.json`, the rate-limit ledger, and
//! per-iteration receipts. Every write goes through the atomic
//! temp-then-rename protocol so partial files are never observable.

pub mod atomic;
pub mod receipts;
pub mod store;

pub use atomic::{atomic_write_json, atomic_write_text};
pub use receipts::{
    EvidenceReceipt, NoFilesWrittenReceipt, RunnerReceipt, count_citations, receipts_dir,
    write_receipt,
};
pub use store::{
    BlockedTask, GateSummary, HISTORY_CAP, HistoryEntry, PersistentState, SnapshotMeta, StateStore,
    TaskAttempts, UnblockEvent, epoch_now, rate_limit_check, utc_now_iso,
};
