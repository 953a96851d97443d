//! Write-back machinery
//!
//! Submodules:
//! - `ledger`: persisted pending-upload entries
//! - `gate`: pause/play switch for the worker
//! - `worker`: the task moving staged files to the origin
pub mod gate;
pub mod ledger;
pub mod worker;

pub use gate::{PauseGate, PauseGuard};
pub use ledger::{PendingUpload, UploadLedger};
pub use worker::UploadWorker;
