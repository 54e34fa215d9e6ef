//! Named secrets.
//!
//! Each secret lives in its own file, keyed by the hex of its name. A secret
//! is generated on first use and never changes afterwards; when two writers
//! race, the first file to land wins and the loser reads it back.

mod cache;
mod store;

pub use cache::SecretCache;
pub use store::SecretStore;
