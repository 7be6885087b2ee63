//! bktool-tree: directory tree replication and backup/restore runs
//!
//! Layering:
//! ```text
//! engine     backup / restore / verify runs (metadata, key, worker pool)
//!   └── replicate  depth-first tree mirror through one StreamCipher
//!         └── attrs      uid/gid + permission bits onto each replica
//! ```

pub mod attrs;
pub mod engine;
pub mod replicate;

pub use engine::{
    backup, restore, run_dir_name, verify, BackupPlan, RestorePlan, RunOptions, RunReport,
    SourceReport,
};
pub use replicate::{EntryFailure, ProgressFn, ReplicateReport, Replicator};
