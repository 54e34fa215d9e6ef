//! Wire format for feeds and entries.
//!
//! Feeds are Atom documents. Report metadata (subject, observed time, typed
//! payload) lives in the report namespace; the payload itself is carried
//! verbatim and never interpreted.

mod atom;
pub mod xml;

pub use atom::{
    decode_feed, encode_entry, encode_feed, DecodedEntry, DecodedFeed, FeedDocument,
    ATOM_CONTENT_TYPE, ATOM_NS, REPORT_NS,
};
