//! Entry log implementation.
//!
//! Entries are stored in an append-only log; indices by id, arrival time,
//! clone identity and subject are kept in memory and rebuilt on open.

mod index;
mod log;

pub use index::EntryIndex;
pub use log::EntryLog;
