//! Transfer engine - streams tasks to disk and hands them to the publisher
//!
//! - One tokio task per transfer, no global cap
//! - Pause acknowledged only after the file is synced
//! - Resume via Range/If-Range, restart from zero when the server refuses
//! - Run ids on every message so superseded runs can be ignored

mod manager;
mod snapshot;
mod transfer;

pub use manager::*;
pub use snapshot::*;
pub use transfer::{TaskFailure, TransferEvent, TransferEventKind, TransferJob};
