//! Chunk tracking (chuck)
//!
//! Responsibilities:
//! - Record which byte ranges of the image have been read, written or
//!   discarded, as a coalesced set of inclusive ranges.
//! - Derive the block-aligned map of those ranges for flashing tools.
//! - Define the byte transfer capability the virtual disk sits on.
//!
//! Submodules:
//! - `tracker`: range set and the known/zeroed chunk tracker
//! - `bmap`: block map derivation and JSON/XML output
//! - `store`: `BackingStore` trait, in-memory and object-backed stores
pub mod bmap;
pub mod store;
pub mod tracker;
